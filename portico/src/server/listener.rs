//! Host listener: one bound endpoint and its accept loop
//!
//! Listeners are created at server start and never reused across restarts.
//! Each one owns its listening socket (inside the accept-loop task), a
//! keep-alive scope, an optional TLS acceptor and a child cancellation
//! token; stopping the listener cancels the token, which unblocks the
//! accept loop, drops the socket and stops the reaper.

/// Per-listener accept configuration, frozen at server start
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcceptConfig {
    pub(crate) no_delay: bool,
    pub(crate) quick_ack: bool,
    pub(crate) request_timeout: std::time::Duration,
}

/// One bound endpoint
pub struct HostListener {
    host: crate::HostOptions,
    local_addr: std::net::SocketAddr,
    server: std::sync::Weak<crate::Server>,
    pub(crate) scope: crate::server::keep_alive::KeepAliveScope,
    pub(crate) tls: Option<tokio_rustls::TlsAcceptor>,
    pub(crate) token: tokio_util::sync::CancellationToken,
    pub(crate) config: AcceptConfig,
}

impl HostListener {
    /// Bind the host and start its accept loop and reaper
    pub(crate) async fn start(
        server: &std::sync::Arc<crate::Server>,
        graceful: &crate::coordination::Graceful,
        host: crate::HostOptions,
        options: &crate::ServerOptions,
    ) -> Result<std::sync::Arc<Self>, crate::ServerError> {
        let addr = host.socket_addr()?;
        let socket = bind(addr, options.maximum_pending_connections).await?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| crate::ServerError::Bind { addr, source })?;

        let tls = if host.tls_active() {
            Some(crate::tls::build_acceptor(&host)?)
        } else {
            None
        };

        let listener = std::sync::Arc::new(Self {
            host,
            local_addr,
            server: std::sync::Arc::downgrade(server),
            scope: crate::server::keep_alive::KeepAliveScope::new(),
            tls,
            token: graceful.child_token(),
            config: AcceptConfig {
                no_delay: options.no_delay,
                quick_ack: options.quick_ack,
                request_timeout: options.request_timeout(),
            },
        });

        crate::server::keep_alive::spawn_reaper(graceful, listener.clone());
        graceful.spawn(accept_loop(socket, listener.clone()));

        tracing::info!(
            addr = %local_addr,
            tls = listener.tls.is_some(),
            "listening"
        );
        Ok(listener)
    }

    /// The actual bound address (differs from the host options on port 0)
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> &crate::HostOptions {
        &self.host
    }

    /// The owning server, if it is still alive
    pub fn server(&self) -> Option<std::sync::Arc<crate::Server>> {
        self.server.upgrade()
    }

    pub(crate) fn request_timeout(&self) -> std::time::Duration {
        self.config.request_timeout
    }

    /// Stop accepting on this endpoint
    ///
    /// Cancels the child token: the accept loop exits and drops the
    /// listening socket, the reaper stops, and the TLS acceptor (with its
    /// certificate) is released when the last `Arc` goes away.
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for HostListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostListener")
            .field("addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Bind with an explicit backlog when configured, system default otherwise
async fn bind(
    addr: std::net::SocketAddr,
    backlog: u32,
) -> Result<tokio::net::TcpListener, crate::ServerError> {
    if backlog == 0 {
        return tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| crate::ServerError::Bind { addr, source });
    }

    let bind_with_backlog = || -> std::io::Result<std::net::TcpListener> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };

    let std_listener =
        bind_with_backlog().map_err(|source| crate::ServerError::Bind { addr, source })?;
    tokio::net::TcpListener::from_std(std_listener)
        .map_err(|source| crate::ServerError::Bind { addr, source })
}

/// The accept loop: owns the listening socket until cancelled
///
/// Accept errors are transient: they are reported through the server's
/// inner-error hook and the loop keeps going. Each accepted socket is handed
/// to its own pipeline task immediately, so loop latency is bounded by
/// `accept` itself.
async fn accept_loop(
    socket: tokio::net::TcpListener,
    listener: std::sync::Arc<HostListener>,
) {
    loop {
        tokio::select! {
            _ = listener.token.cancelled() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(crate::server::accept::pipeline(
                        listener.clone(),
                        stream,
                        peer,
                    ));
                }
                Err(source) => {
                    tracing::warn!(addr = %listener.local_addr, %source, "accept failed");
                    if let Some(server) = listener.server() {
                        server.report(&crate::ServerError::Accept {
                            addr: listener.local_addr,
                            source,
                        });
                    }
                    // brief pause so a persistent failure cannot spin the loop
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!(addr = %listener.local_addr, "listener stopped");
}
