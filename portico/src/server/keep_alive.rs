//! Keep-alive scope and reaper
//!
//! Every listener tracks its not-yet-handed-over connections here. The
//! accept pipeline inserts on accept and removes on successful handover to a
//! protocol; the reaper force-closes whatever overstays the handshake
//! deadline and sweeps out entries that were closed by other means.

/// Per-listener set of Pending/Handshaking connections
pub(crate) struct KeepAliveScope {
    connections: scc::HashMap<u64, std::sync::Arc<crate::Connection>>,
}

impl KeepAliveScope {
    pub(crate) fn new() -> Self {
        Self {
            connections: scc::HashMap::new(),
        }
    }

    pub(crate) fn insert(&self, connection: std::sync::Arc<crate::Connection>) {
        let _ = self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn remove(&self, connection: &crate::Connection) {
        self.connections.remove(&connection.id());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Collect connections past their handshake deadline and drop them from
    /// the scope, along with anything that already reached `Closed`
    pub(crate) async fn collect_expired(
        &self,
        now: std::time::Instant,
    ) -> Vec<std::sync::Arc<crate::Connection>> {
        let mut expired = Vec::new();
        let mut swept = Vec::new();

        self.connections
            .scan_async(|_, connection| {
                match connection.state() {
                    crate::ConnectionState::Closed => swept.push(connection.id()),
                    crate::ConnectionState::Pending | crate::ConnectionState::Handshaking => {
                        if connection.handshake_expired(now) {
                            expired.push(connection.clone());
                        }
                    }
                    // handed over but not yet removed; leave it to the pipeline
                    _ => {}
                }
            })
            .await;

        for connection in &expired {
            self.connections.remove_async(&connection.id()).await;
        }
        for id in swept {
            self.connections.remove_async(&id).await;
        }

        expired
    }
}

/// How often a listener's reaper scans its scope
pub(crate) fn tick_interval(request_timeout: std::time::Duration) -> std::time::Duration {
    (request_timeout / 4)
        .min(std::time::Duration::from_secs(1))
        .max(std::time::Duration::from_millis(10))
}

/// Spawn the reaper loop for one listener
pub(crate) fn spawn_reaper(
    graceful: &crate::coordination::Graceful,
    listener: std::sync::Arc<crate::server::HostListener>,
) {
    let tick = tick_interval(listener.request_timeout());
    graceful.spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = listener.token.cancelled() => break,
                _ = interval.tick() => {
                    let expired = listener.scope.collect_expired(std::time::Instant::now()).await;
                    for connection in expired {
                        tracing::debug!(
                            id = connection.id(),
                            peer = %connection.peer_addr(),
                            "handshake deadline expired"
                        );
                        connection.disconnect().await;
                    }
                }
            }
        }
        tracing::debug!(addr = %listener.local_addr(), "reaper stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_connection(timeout: std::time::Duration) -> std::sync::Arc<crate::Connection> {
        crate::Connection::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:2626".parse().unwrap(),
            false,
            std::sync::Weak::new(),
            timeout,
        )
    }

    #[test]
    fn test_tick_interval_bounds() {
        assert_eq!(
            tick_interval(std::time::Duration::from_secs(30)),
            std::time::Duration::from_secs(1)
        );
        assert_eq!(
            tick_interval(std::time::Duration::from_secs(2)),
            std::time::Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn test_expired_pending_connection_is_collected() {
        let scope = KeepAliveScope::new();
        let connection = pending_connection(std::time::Duration::from_millis(1));
        scope.insert(connection.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let expired = scope.collect_expired(std::time::Instant::now()).await;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), connection.id());
        assert_eq!(scope.len(), 0);
    }

    #[tokio::test]
    async fn test_connected_connection_is_left_alone() {
        let scope = KeepAliveScope::new();
        let connection = pending_connection(std::time::Duration::from_millis(1));
        connection.advance(crate::ConnectionState::Handshaking);
        connection.advance(crate::ConnectionState::Connected);
        scope.insert(connection.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let expired = scope.collect_expired(std::time::Instant::now()).await;

        assert!(expired.is_empty());
        assert_eq!(scope.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_swept() {
        let scope = KeepAliveScope::new();
        let connection = pending_connection(std::time::Duration::from_secs(30));
        scope.insert(connection.clone());
        connection.disconnect().await;

        let expired = scope.collect_expired(std::time::Instant::now()).await;
        assert!(expired.is_empty());
        assert_eq!(scope.len(), 0);
    }
}
