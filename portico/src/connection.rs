//! Connection: one accepted transport stream and its liveness state
//!
//! A `Connection` exclusively owns the write half of its transport; every
//! send variant goes through a single async mutex so concurrent writers are
//! serialized and each submission reaches the peer contiguously. The read
//! half travels separately: the accept pipeline peeks the greeting from it,
//! then hands it to the winning protocol as a [`ConnectionStream`] with the
//! greeting replayed at its head.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// How many bytes the accept pipeline peeks for protocol recognition
pub const GREETING_LEN: usize = 8;

/// Connection lifecycle states, strictly forward-moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, transport not yet usable (TLS may still be running)
    Pending = 0,
    /// Greeting peeked, protocols being consulted
    Handshaking = 1,
    /// A protocol accepted and owns the connection
    Connected = 2,
    /// Teardown in progress
    Closing = 3,
    /// Transport released; terminal
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Handshaking,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// The accepted byte stream, plain or TLS-wrapped
pub(crate) enum Transport {
    Plain(tokio::net::TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>),
}

impl tokio::io::AsyncRead for Transport {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Transport {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Inbound byte stream handed to the winning protocol
///
/// Yields the peeked greeting bytes first, then reads from the transport.
/// The greeting is delivered exactly once; it is never re-read from the
/// socket.
pub struct ConnectionStream {
    pending: bytes::Bytes,
    inner: tokio::io::ReadHalf<Transport>,
}

impl ConnectionStream {
    pub(crate) fn new(pending: bytes::Bytes, inner: tokio::io::ReadHalf<Transport>) -> Self {
        Self { pending, inner }
    }

    /// Push bytes back to the head of the stream
    ///
    /// Used when handing the stream to another protocol after a switch: any
    /// bytes the previous protocol read past its own frames are replayed to
    /// the next one.
    pub fn prepend(&mut self, bytes: bytes::Bytes) {
        if bytes.is_empty() {
            return;
        }
        if self.pending.is_empty() {
            self.pending = bytes;
        } else {
            let mut joined = bytes::BytesMut::with_capacity(bytes.len() + self.pending.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.pending);
            self.pending = joined.freeze();
        }
    }
}

impl tokio::io::AsyncRead for ConnectionStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let take = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..take]);
            bytes::Buf::advance(&mut this.pending, take);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

const POOLED_BUFFERS: usize = 32;
const MIN_BUFFER_CAPACITY: usize = 4096;

static BUFFER_POOL: std::sync::LazyLock<BufferPool> = std::sync::LazyLock::new(BufferPool::new);

/// Freelist of scratch buffers for scatter/gather sends
///
/// `send_vectored` rents a contiguous buffer, copies the slices in, writes,
/// and the RAII guard returns the buffer on every exit path.
struct BufferPool {
    free: std::sync::Mutex<Vec<bytes::BytesMut>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            free: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn rent(&'static self, capacity: usize) -> PooledBuffer {
        let mut buffer = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| bytes::BytesMut::with_capacity(capacity.max(MIN_BUFFER_CAPACITY)));
        buffer.clear();
        buffer.reserve(capacity);
        PooledBuffer {
            buffer,
            pool: self,
        }
    }

    fn give_back(&self, buffer: bytes::BytesMut) {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < POOLED_BUFFERS {
            free.push(buffer);
        }
    }
}

struct PooledBuffer {
    buffer: bytes::BytesMut,
    pool: &'static BufferPool,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = bytes::BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One accepted connection
///
/// Owned by its accept-pipeline task for the duration of the handshake, then
/// shared between the protocol handler, the reaper (until handover) and the
/// heartbeat manager. All mutation goes through atomics or the write mutex,
/// so every method takes `&self`.
pub struct Connection {
    id: u64,
    peer: std::net::SocketAddr,
    local: std::net::SocketAddr,
    secure: bool,
    listener: std::sync::Weak<crate::server::HostListener>,

    state: AtomicU8,
    writer: tokio::sync::Mutex<Option<tokio::io::WriteHalf<Transport>>>,
    protocol: std::sync::RwLock<Option<std::sync::Arc<dyn crate::Protocol>>>,
    socket: std::sync::RwLock<Option<std::sync::Arc<dyn crate::ProtocolSocket>>>,

    epoch: std::time::Instant,
    deadline: std::time::Instant,
    last_activity_ms: AtomicU64,
    pong_required: AtomicBool,
    smart_health_check: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        peer: std::net::SocketAddr,
        local: std::net::SocketAddr,
        secure: bool,
        listener: std::sync::Weak<crate::server::HostListener>,
        request_timeout: std::time::Duration,
    ) -> std::sync::Arc<Self> {
        let now = std::time::Instant::now();
        std::sync::Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            local,
            secure,
            listener,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            writer: tokio::sync::Mutex::new(None),
            protocol: std::sync::RwLock::new(None),
            socket: std::sync::RwLock::new(None),
            epoch: now,
            deadline: now + request_timeout,
            last_activity_ms: AtomicU64::new(0),
            pong_required: AtomicBool::new(false),
            smart_health_check: AtomicBool::new(false),
        })
    }

    /// Identity token, unique for the process lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    /// Bound address of the listener that accepted this connection
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local
    }

    /// Whether the transport is TLS-wrapped
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The listener this connection arrived on, if it is still running
    pub fn listener(&self) -> Option<std::sync::Arc<crate::server::HostListener>> {
        self.listener.upgrade()
    }

    /// The server this connection belongs to, if it is still running
    pub fn server(&self) -> Option<std::sync::Arc<crate::Server>> {
        self.listener.upgrade().and_then(|l| l.server())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Advance the state machine; states only move forward
    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        let target = to as u8;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= target {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Split the transport; store the write half, hand the read half back
    pub(crate) async fn install_transport(
        &self,
        transport: Transport,
    ) -> tokio::io::ReadHalf<Transport> {
        let (reader, writer) = tokio::io::split(transport);
        *self.writer.lock().await = Some(writer);
        reader
    }

    /// Install the winning protocol and its socket facade
    ///
    /// A switch replaces the protocol and, when the new handshake supplied
    /// one, the socket; otherwise the previous socket is retained.
    pub(crate) fn install(
        &self,
        protocol: std::sync::Arc<dyn crate::Protocol>,
        socket: Option<std::sync::Arc<dyn crate::ProtocolSocket>>,
    ) {
        *self.protocol.write().expect("protocol lock poisoned") = Some(protocol);
        if let Some(socket) = socket {
            *self.socket.write().expect("socket lock poisoned") = Some(socket);
        }
    }

    /// Name of the currently installed protocol
    pub fn protocol_name(&self) -> Option<String> {
        self.protocol
            .read()
            .expect("protocol lock poisoned")
            .as_ref()
            .map(|p| p.name().to_string())
    }

    /// The protocol socket produced by the handshake, if any
    pub fn socket(&self) -> Option<std::sync::Arc<dyn crate::ProtocolSocket>> {
        self.socket.read().expect("socket lock poisoned").clone()
    }

    /// Send bytes; `false` when the connection is closed or the write fails
    ///
    /// Writes are serialized: concurrent senders queue on the write mutex and
    /// each submission reaches the peer contiguously, in lock-acquisition
    /// order. A failed write disconnects the connection.
    pub async fn send(&self, data: &[u8]) -> bool {
        if self.state() >= ConnectionState::Closing {
            return false;
        }

        let outcome = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return false;
            };
            async {
                writer.write_all(data).await?;
                writer.flush().await
            }
            .await
        };

        match outcome {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(id = self.id, peer = %self.peer, %error, "write failed");
                self.disconnect().await;
                false
            }
        }
    }

    /// Scatter/gather send: the slices are copied into one pooled contiguous
    /// buffer and written as a single serialized submission
    pub async fn send_vectored(&self, slices: &[std::io::IoSlice<'_>]) -> bool {
        let total: usize = slices.iter().map(|s| s.len()).sum();
        if total == 0 {
            return self.state() < ConnectionState::Closing;
        }
        let mut buffer = BUFFER_POOL.rent(total);
        for slice in slices {
            buffer.extend_from_slice(slice);
        }
        self.send(&buffer).await
    }

    /// Non-blocking send; `completion` fires with the drain result
    pub fn send_with<F>(self: std::sync::Arc<Self>, data: bytes::Bytes, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        tokio::spawn(async move {
            completion(self.send(&data).await);
        });
    }

    /// Refresh the liveness timestamp and clear the outstanding-pong flag
    ///
    /// Called by the protocol layer on any inbound activity, including pong
    /// receipt.
    pub fn keep_alive(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
        self.pong_required.store(false, Ordering::Release);
    }

    /// Time since the last `keep_alive` call (connection age when never called)
    pub fn idle_for(&self) -> std::time::Duration {
        let last = std::time::Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Whether the handshake deadline has passed
    pub(crate) fn handshake_expired(&self, now: std::time::Instant) -> bool {
        now > self.deadline
    }

    pub(crate) fn pong_required(&self) -> bool {
        self.pong_required.load(Ordering::Acquire)
    }

    pub(crate) fn set_pong_required(&self) {
        self.pong_required.store(true, Ordering::Release);
    }

    /// Suppress heartbeat pings while the connection shows recent activity
    pub fn set_smart_health_check(&self, enabled: bool) {
        self.smart_health_check.store(enabled, Ordering::Release);
    }

    pub fn smart_health_check(&self) -> bool {
        self.smart_health_check.load(Ordering::Acquire)
    }

    /// Ping the peer through the installed protocol socket
    pub async fn ping(&self) -> bool {
        match self.socket() {
            Some(socket) => socket.ping().await,
            None => false,
        }
    }

    /// Pong the peer through the installed protocol socket
    pub async fn pong(&self, payload: Option<bytes::Bytes>) -> bool {
        match self.socket() {
            Some(socket) => socket.pong(payload).await,
            None => false,
        }
    }

    /// Close the connection; idempotent
    ///
    /// Exactly one caller wins the transition to `Closing`, shuts the
    /// transport down best-effort and fires the socket's `on_disconnected`
    /// hook. Every other caller returns `false` immediately.
    pub async fn disconnect(&self) -> bool {
        if !self.advance(ConnectionState::Closing) {
            return false;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let socket = self.socket.write().expect("socket lock poisoned").take();
        self.protocol
            .write()
            .expect("protocol lock poisoned")
            .take();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);

        if let Some(socket) = socket {
            socket.on_disconnected();
        }

        tracing::debug!(id = self.id, peer = %self.peer, "connection closed");
        true
    }

    /// Read up to [`GREETING_LEN`] bytes for protocol recognition
    pub(crate) async fn peek_greeting(
        reader: &mut tokio::io::ReadHalf<Transport>,
    ) -> std::io::Result<bytes::Bytes> {
        let mut greeting = [0u8; GREETING_LEN];
        let read = reader.read(&mut greeting).await?;
        Ok(bytes::Bytes::copy_from_slice(&greeting[..read]))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("secure", &self.secure)
            .field("state", &self.state())
            .finish()
    }
}
