//! Heartbeat manager
//!
//! Process-wide ping/pong over connected sockets whose protocol opted in.
//! A ping that goes unanswered for a full tick gets the connection
//! disconnected; pong receipt is delivered by the protocol layer through
//! `Connection::keep_alive`, which clears the outstanding flag.

/// Roster of heartbeat-participating connections
pub(crate) struct Heartbeat {
    roster: scc::HashMap<u64, std::sync::Arc<crate::Connection>>,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self {
            roster: scc::HashMap::new(),
        }
    }

    /// Add a connection whose socket opted into ping/pong
    pub(crate) fn enroll(&self, connection: &std::sync::Arc<crate::Connection>) {
        let opted_in = connection
            .socket()
            .map(|socket| socket.heartbeat())
            .unwrap_or(false);
        if opted_in {
            let _ = self.roster.insert(connection.id(), connection.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.roster.len()
    }

    /// One heartbeat pass over the roster
    pub(crate) async fn tick(&self, interval: std::time::Duration) {
        let mut live = Vec::new();
        let mut stale = Vec::new();

        self.roster
            .scan_async(|_, connection| {
                if connection.is_connected() {
                    live.push(connection.clone());
                } else {
                    stale.push(connection.id());
                }
            })
            .await;

        for connection in live {
            if connection.smart_health_check() && connection.idle_for() < interval {
                continue;
            }
            if connection.pong_required() {
                // previous ping went unanswered
                tracing::debug!(
                    id = connection.id(),
                    peer = %connection.peer_addr(),
                    "heartbeat missed, disconnecting"
                );
                connection.disconnect().await;
                stale.push(connection.id());
                continue;
            }
            connection.set_pong_required();
            if !connection.ping().await {
                stale.push(connection.id());
            }
        }

        for id in stale {
            self.roster.remove_async(&id).await;
        }
    }
}

/// Spawn the heartbeat loop for one server run
pub(crate) fn spawn(
    graceful: &crate::coordination::Graceful,
    heartbeat: std::sync::Arc<Heartbeat>,
    interval: std::time::Duration,
) {
    let lifecycle = graceful.clone();
    graceful.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick of tokio's interval fires immediately; skip it so
        // fresh connections get a full interval before their first ping
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => break,
                _ = ticker.tick() => heartbeat.tick(interval).await,
            }
        }
        tracing::debug!("heartbeat stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSocket {
        pings: std::sync::atomic::AtomicUsize,
        disconnects: std::sync::atomic::AtomicUsize,
    }

    impl CountingSocket {
        fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                pings: std::sync::atomic::AtomicUsize::new(0),
                disconnects: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl crate::ProtocolSocket for CountingSocket {
        async fn ping(&self) -> bool {
            self.pings.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }

        async fn pong(&self, _payload: Option<bytes::Bytes>) -> bool {
            true
        }

        fn heartbeat(&self) -> bool {
            true
        }

        fn on_disconnected(&self) {
            self.disconnects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct Noop;

    #[async_trait::async_trait]
    impl crate::Protocol for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn handshake(
            &self,
            _connection: &std::sync::Arc<crate::Connection>,
            _greeting: &[u8],
        ) -> Result<crate::Handshake, crate::ProtocolError> {
            Ok(crate::Handshake::accepted())
        }

        async fn serve(
            &self,
            _connection: std::sync::Arc<crate::Connection>,
            _stream: crate::ConnectionStream,
        ) -> Result<(), crate::ProtocolError> {
            Ok(())
        }
    }

    fn connected_with_socket(
        socket: std::sync::Arc<CountingSocket>,
    ) -> std::sync::Arc<crate::Connection> {
        let connection = crate::Connection::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:2626".parse().unwrap(),
            false,
            std::sync::Weak::new(),
            std::time::Duration::from_secs(30),
        );
        connection.advance(crate::ConnectionState::Handshaking);
        connection.advance(crate::ConnectionState::Connected);
        connection.install(std::sync::Arc::new(Noop), Some(socket));
        connection
    }

    #[tokio::test]
    async fn test_unanswered_ping_disconnects_on_second_tick() {
        let heartbeat = Heartbeat::new();
        let socket = CountingSocket::new();
        let connection = connected_with_socket(socket.clone());
        heartbeat.enroll(&connection);
        assert_eq!(heartbeat.len(), 1);

        let interval = std::time::Duration::from_secs(60);

        heartbeat.tick(interval).await;
        assert_eq!(socket.pings.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(connection.pong_required());

        // no pong arrived before the next tick
        heartbeat.tick(interval).await;
        assert!(connection.is_closed());
        assert_eq!(
            socket.disconnects.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(heartbeat.len(), 0);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let heartbeat = Heartbeat::new();
        let socket = CountingSocket::new();
        let connection = connected_with_socket(socket.clone());
        heartbeat.enroll(&connection);

        let interval = std::time::Duration::from_secs(60);

        heartbeat.tick(interval).await;
        connection.keep_alive(); // pong delivered by the protocol layer
        heartbeat.tick(interval).await;

        assert!(connection.is_connected());
        assert_eq!(socket.pings.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_smart_health_check_suppresses_ping() {
        let heartbeat = Heartbeat::new();
        let socket = CountingSocket::new();
        let connection = connected_with_socket(socket.clone());
        connection.set_smart_health_check(true);
        connection.keep_alive(); // fresh activity
        heartbeat.enroll(&connection);

        heartbeat.tick(std::time::Duration::from_secs(60)).await;

        assert_eq!(socket.pings.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!connection.pong_required());
    }

    #[tokio::test]
    async fn test_socket_without_opt_in_is_not_enrolled() {
        struct QuietSocket;

        #[async_trait::async_trait]
        impl crate::ProtocolSocket for QuietSocket {
            async fn ping(&self) -> bool {
                true
            }

            async fn pong(&self, _payload: Option<bytes::Bytes>) -> bool {
                true
            }
        }

        let heartbeat = Heartbeat::new();
        let connection = crate::Connection::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:2626".parse().unwrap(),
            false,
            std::sync::Weak::new(),
            std::time::Duration::from_secs(30),
        );
        connection.advance(crate::ConnectionState::Connected);
        connection.install(std::sync::Arc::new(Noop), Some(std::sync::Arc::new(QuietSocket)));

        heartbeat.enroll(&connection);
        assert_eq!(heartbeat.len(), 0);
    }
}
