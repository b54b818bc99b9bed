//! Server facade: composition root for listeners, registry and heartbeat
//!
//! A `Server` owns the protocol registry, builds one listener per configured
//! host at `start()`, runs the heartbeat manager when configured, and exposes
//! the switch-protocol operation that re-handshakes a live connection under
//! another protocol.

mod accept;
mod heartbeat;
pub(crate) mod keep_alive;
mod listener;

pub use listener::HostListener;

type ServerHook = Box<dyn Fn(&Server) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Server, &crate::ServerError) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    started: std::sync::Mutex<Vec<ServerHook>>,
    stopped: std::sync::Mutex<Vec<ServerHook>>,
    inner_error: std::sync::Mutex<Vec<ErrorHook>>,
}

/// The multi-protocol TCP server
pub struct Server {
    options: std::sync::RwLock<crate::ServerOptions>,
    registry: crate::ProtocolRegistry,
    listeners: std::sync::Mutex<Vec<std::sync::Arc<HostListener>>>,
    heartbeat: std::sync::Arc<heartbeat::Heartbeat>,
    graceful: std::sync::Mutex<Option<crate::coordination::Graceful>>,
    running: std::sync::atomic::AtomicBool,
    hooks: Hooks,
    // listeners keep a Weak back-pointer to the server; the cyclic handle is
    // how `start` hands it to them
    self_ref: std::sync::Weak<Server>,
}

impl Server {
    pub fn new(options: crate::ServerOptions) -> std::sync::Arc<Self> {
        std::sync::Arc::new_cyclic(|self_ref| Self {
            options: std::sync::RwLock::new(options),
            registry: crate::ProtocolRegistry::new(),
            listeners: std::sync::Mutex::new(Vec::new()),
            heartbeat: std::sync::Arc::new(heartbeat::Heartbeat::new()),
            graceful: std::sync::Mutex::new(None),
            running: std::sync::atomic::AtomicBool::new(false),
            hooks: Hooks::default(),
            self_ref: self_ref.clone(),
        })
    }

    /// Current options snapshot
    pub fn options(&self) -> crate::ServerOptions {
        self.options.read().expect("options lock poisoned").clone()
    }

    /// Register an application protocol (see [`crate::ProtocolRegistry::add`])
    pub fn use_protocol<P: crate::Protocol + 'static>(&self, protocol: P) {
        self.registry.add(std::sync::Arc::new(protocol));
    }

    /// Register an already-shared protocol object
    pub fn use_protocol_shared(&self, protocol: std::sync::Arc<dyn crate::Protocol>) {
        self.registry.add(protocol);
    }

    pub fn registry(&self) -> &crate::ProtocolRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Bound listeners of the current run (empty when stopped)
    pub fn listeners(&self) -> Vec<std::sync::Arc<HostListener>> {
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .clone()
    }

    /// Register a hook fired after a successful `start()`
    ///
    /// Hooks are expected to be registered before `start`; registration is
    /// not synchronized against a concurrent start.
    pub fn on_started<F: Fn(&Server) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks
            .started
            .lock()
            .expect("hooks lock poisoned")
            .push(Box::new(hook));
    }

    /// Register a hook fired exactly once per `stop()`
    pub fn on_stopped<F: Fn(&Server) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks
            .stopped
            .lock()
            .expect("hooks lock poisoned")
            .push(Box::new(hook));
    }

    /// Register a hook for errors isolated to a single connection or accept
    ///
    /// Without subscribers such errors are logged and swallowed; they never
    /// abort the accept loop.
    pub fn on_inner_error<F: Fn(&Server, &crate::ServerError) + Send + Sync + 'static>(
        &self,
        hook: F,
    ) {
        self.hooks
            .inner_error
            .lock()
            .expect("hooks lock poisoned")
            .push(Box::new(hook));
    }

    /// Start every configured host listener
    ///
    /// Rejected when already running or no hosts are configured. A bind
    /// failure is fatal only to its own listener; `start` fails outright only
    /// when every host failed.
    pub async fn start(&self) -> Result<(), crate::ServerError> {
        if self.running.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Err(crate::ServerError::AlreadyRunning);
        }

        let options = self.options();
        if options.hosts.is_empty() {
            self.running
                .store(false, std::sync::atomic::Ordering::Release);
            return Err(crate::ServerError::NoHosts);
        }

        let this = self
            .self_ref
            .upgrade()
            .expect("server is always constructed inside an Arc");
        let graceful = crate::coordination::Graceful::new();
        let mut listeners = Vec::new();
        let mut first_failure = None;

        for host in options.hosts.clone() {
            match HostListener::start(&this, &graceful, host, &options).await {
                Ok(listener) => listeners.push(listener),
                Err(error) => {
                    tracing::error!(%error, "listener failed to start");
                    self.report(&error);
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    }
                }
            }
        }

        if listeners.is_empty() {
            graceful.shutdown().await;
            self.running
                .store(false, std::sync::atomic::Ordering::Release);
            return Err(first_failure.unwrap_or(crate::ServerError::NoHosts));
        }

        if let Some(interval) = options.ping_interval() {
            heartbeat::spawn(&graceful, self.heartbeat.clone(), interval);
        }

        *self.listeners.lock().expect("listeners lock poisoned") = listeners;
        *self.graceful.lock().expect("graceful lock poisoned") = Some(graceful);

        tracing::info!(hosts = options.hosts.len(), "server started");
        for hook in self
            .hooks
            .started
            .lock()
            .expect("hooks lock poisoned")
            .iter()
        {
            hook(self);
        }
        Ok(())
    }

    /// Stop accepting and halt the background loops
    ///
    /// Already-connected clients are not disconnected; their handlers run to
    /// completion. The stopped hooks fire exactly once per run, no matter how
    /// many callers race into `stop`.
    pub async fn stop(&self) {
        if !self.running.swap(false, std::sync::atomic::Ordering::AcqRel) {
            return;
        }

        let listeners: Vec<_> =
            std::mem::take(&mut *self.listeners.lock().expect("listeners lock poisoned"));
        for listener in &listeners {
            listener.stop();
        }

        let graceful = self
            .graceful
            .lock()
            .expect("graceful lock poisoned")
            .take();
        if let Some(graceful) = graceful {
            graceful.shutdown().await;
        }

        tracing::info!("server stopped");
        for hook in self
            .hooks
            .stopped
            .lock()
            .expect("hooks lock poisoned")
            .iter()
        {
            hook(self);
        }
    }

    /// Start and block until `stop()` is called or Ctrl-C arrives
    pub async fn run(&self) -> Result<(), crate::ServerError> {
        self.start().await?;
        // a racing `stop()` may already have taken the lifecycle handle
        let Some(graceful) = self
            .graceful
            .lock()
            .expect("graceful lock poisoned")
            .clone()
        else {
            return Ok(());
        };

        tokio::select! {
            _ = graceful.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                self.stop().await;
            }
        }
        Ok(())
    }

    /// Blocking variant bound to a single plain host on `port`
    pub async fn run_on(&self, port: u16) -> Result<(), crate::ServerError> {
        self.options
            .write()
            .expect("options lock poisoned")
            .hosts = vec![crate::HostOptions::plain(port)];
        self.run().await
    }

    /// Re-handshake a live connection under another protocol
    ///
    /// The calling protocol hands over the inbound stream it owns. On
    /// rejection (or an unknown name) the connection is closed; on acceptance
    /// the installed protocol is replaced, the optional reply is written, the
    /// socket's `on_protocol_switched` hook fires once, and the new
    /// protocol's `serve` runs with the surrendered stream.
    pub async fn switch_protocol(
        &self,
        connection: &std::sync::Arc<crate::Connection>,
        name: &str,
        data: &crate::SwitchData,
        stream: crate::ConnectionStream,
    ) -> Result<(), crate::ServerError> {
        let peer = connection.peer_addr();

        let Some(protocol) = self.registry.find(name) else {
            connection.disconnect().await;
            return Err(crate::ServerError::UnknownProtocol(name.to_string()));
        };

        match protocol.switch(connection, data).await {
            Ok(crate::Handshake::Accepted { reply, socket }) => {
                let previous = connection.protocol_name().unwrap_or_default();
                connection.install(protocol.clone(), socket);

                if let Some(reply) = reply {
                    if !connection.send(&reply).await {
                        return Err(crate::ServerError::Write { peer });
                    }
                }

                if let Some(socket) = connection.socket() {
                    socket.on_protocol_switched(&previous, protocol.name());
                }
                self.enroll_heartbeat(connection);

                tracing::debug!(
                    id = connection.id(),
                    from = %previous,
                    to = protocol.name(),
                    "protocol switched"
                );

                let result = protocol.serve(connection.clone(), stream).await;
                connection.disconnect().await;
                result.map_err(|source| crate::ServerError::Connection { peer, source })
            }
            Ok(crate::Handshake::Rejected) => {
                tracing::debug!(id = connection.id(), to = name, "switch rejected");
                connection.disconnect().await;
                Ok(())
            }
            Err(source) => {
                connection.disconnect().await;
                Err(crate::ServerError::Handshake { peer, source })
            }
        }
    }

    /// Fan an isolated error out to the inner-error hooks
    pub(crate) fn report(&self, error: &crate::ServerError) {
        let hooks = self
            .hooks
            .inner_error
            .lock()
            .expect("hooks lock poisoned");
        if hooks.is_empty() {
            tracing::error!(%error, "inner error");
            return;
        }
        for hook in hooks.iter() {
            hook(self, error);
        }
    }

    pub(crate) fn enroll_heartbeat(&self, connection: &std::sync::Arc<crate::Connection>) {
        let enabled = self
            .options
            .read()
            .expect("options lock poisoned")
            .ping_interval
            > 0;
        if enabled {
            self.heartbeat.enroll(connection);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .field("protocols", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_start_without_hosts_is_rejected() {
        let server = crate::Server::new(crate::ServerOptions::default());
        assert!(matches!(
            server.start().await,
            Err(crate::ServerError::NoHosts)
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let server = crate::Server::new(crate::ServerOptions::on_port(0));
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(crate::ServerError::AlreadyRunning)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fires_exactly_once() {
        let server = crate::Server::new(crate::ServerOptions::on_port(0));
        let stops = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = stops.clone();
        server.on_stopped(move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;

        assert_eq!(stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = crate::Server::new(crate::ServerOptions::on_port(0));
        server.start().await.unwrap();
        server.stop().await;
        // listeners are rebuilt, never reused
        server.start().await.unwrap();
        assert!(server.is_running());
        server.stop().await;
    }
}
