//! Pluggable application protocols and their registry
//!
//! The framework does not parse application messages; it only peeks the
//! first few bytes of each accepted stream and asks every registered
//! protocol, in registration order, whether it recognizes them. The first
//! protocol to accept owns the connection until it returns from `serve` or
//! hands the stream over through a protocol switch.

/// Outcome of a protocol handshake attempt
///
/// Explicit result instead of exception-driven control flow: rejection is a
/// normal outcome, not an error.
pub enum Handshake {
    Accepted {
        /// Bytes written to the peer before `serve` runs, through the
        /// connection's serialized write discipline
        reply: Option<bytes::Bytes>,
        /// Protocol-specific facade installed on the connection; also the
        /// heartbeat opt-in point
        socket: Option<std::sync::Arc<dyn ProtocolSocket>>,
    },
    Rejected,
}

impl Handshake {
    /// Accept with no reply and no socket facade
    pub fn accepted() -> Self {
        Self::Accepted {
            reply: None,
            socket: None,
        }
    }

    pub fn with_reply(reply: impl Into<bytes::Bytes>) -> Self {
        Self::Accepted {
            reply: Some(reply.into()),
            socket: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Application-supplied data driving a protocol switch
///
/// A switch re-handshakes an existing connection with data produced by the
/// current protocol (an upgrade request, negotiated parameters) rather than
/// bytes peeked from the wire.
#[derive(Debug, Default, Clone)]
pub struct SwitchData {
    properties: std::collections::HashMap<String, String>,
}

impl SwitchData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }
}

/// An application protocol plugged into the server
///
/// Implementations are shared immutable objects: the registry holds them by
/// `Arc` and every connection that accepted under a protocol keeps its
/// reference even if the registry entry is later replaced.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync {
    /// Registry name, matched case-insensitively
    fn name(&self) -> &str;

    /// Inspect the peeked greeting (at most [`crate::GREETING_LEN`] bytes,
    /// possibly fewer) and decide whether this protocol owns the connection
    async fn handshake(
        &self,
        connection: &std::sync::Arc<crate::Connection>,
        greeting: &[u8],
    ) -> Result<Handshake, crate::ProtocolError>;

    /// Re-handshake an already-connected connection with application data
    ///
    /// Default: this protocol cannot be switched to.
    async fn switch(
        &self,
        connection: &std::sync::Arc<crate::Connection>,
        data: &SwitchData,
    ) -> Result<Handshake, crate::ProtocolError> {
        let _ = (connection, data);
        Ok(Handshake::Rejected)
    }

    /// Per-connection service loop; blocks for the life of the connection
    ///
    /// `stream` starts with the greeting bytes replayed, so the protocol
    /// parses its wire format from byte zero.
    async fn serve(
        &self,
        connection: std::sync::Arc<crate::Connection>,
        stream: crate::ConnectionStream,
    ) -> Result<(), crate::ProtocolError>;
}

/// Protocol-specific view of a connection
///
/// Returned by a handshake and installed on the connection as a facade for
/// application code. Implementations hold a `Weak` back-reference to the
/// connection so the Connection → socket → Connection graph stays cycle-free.
#[async_trait::async_trait]
pub trait ProtocolSocket: Send + Sync {
    /// Send a protocol-level ping frame
    async fn ping(&self) -> bool;

    /// Send a protocol-level pong frame
    async fn pong(&self, payload: Option<bytes::Bytes>) -> bool;

    /// Whether this socket participates in the server heartbeat
    fn heartbeat(&self) -> bool {
        false
    }

    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    /// Fired after a successful protocol switch, before the new protocol's
    /// `serve` runs
    fn on_protocol_switched(&self, previous: &str, current: &str) {
        let _ = (previous, current);
    }
}

/// Ordered, copy-on-write protocol registry
///
/// Registration order defines the handshake priority: the first protocol to
/// accept a greeting wins. Mutations publish a fresh snapshot, so the accept
/// pipeline iterates a stable sequence even while `add` runs concurrently.
pub struct ProtocolRegistry {
    protocols: arc_swap::ArcSwap<Vec<std::sync::Arc<dyn Protocol>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: arc_swap::ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register a protocol
    ///
    /// A protocol with the same (case-insensitive) name replaces the
    /// existing entry in place, keeping its priority slot; a new name is
    /// appended at the tail.
    pub fn add(&self, protocol: std::sync::Arc<dyn Protocol>) {
        self.protocols.rcu(|current| {
            let mut next = current.as_ref().clone();
            match next
                .iter()
                .position(|p| p.name().eq_ignore_ascii_case(protocol.name()))
            {
                Some(slot) => next[slot] = protocol.clone(),
                None => next.push(protocol.clone()),
            }
            next
        });
    }

    /// Unregister a protocol by name
    ///
    /// Connections that already handshook under it keep their reference and
    /// are unaffected.
    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        self.protocols.rcu(|current| {
            let mut next = current.as_ref().clone();
            let before = next.len();
            next.retain(|p| !p.name().eq_ignore_ascii_case(name));
            removed = next.len() != before;
            next
        });
        removed
    }

    /// Case-insensitive lookup, first hit
    pub fn find(&self, name: &str) -> Option<std::sync::Arc<dyn Protocol>> {
        self.protocols
            .load()
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Stable snapshot in priority order
    pub fn snapshot(&self) -> std::sync::Arc<Vec<std::sync::Arc<dyn Protocol>>> {
        self.protocols.load_full()
    }

    pub fn len(&self) -> usize {
        self.protocols.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.load().is_empty()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, u8);

    #[async_trait::async_trait]
    impl Protocol for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handshake(
            &self,
            _connection: &std::sync::Arc<crate::Connection>,
            greeting: &[u8],
        ) -> Result<Handshake, crate::ProtocolError> {
            if greeting.first() == Some(&self.1) {
                Ok(Handshake::accepted())
            } else {
                Ok(Handshake::Rejected)
            }
        }

        async fn serve(
            &self,
            _connection: std::sync::Arc<crate::Connection>,
            _stream: crate::ConnectionStream,
        ) -> Result<(), crate::ProtocolError> {
            Ok(())
        }
    }

    #[test]
    fn test_add_appends_in_order() {
        let registry = ProtocolRegistry::new();
        registry.add(std::sync::Arc::new(Named("alpha", 1)));
        registry.add(std::sync::Arc::new(Named("beta", 2)));

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_replace_keeps_priority_slot() {
        let registry = ProtocolRegistry::new();
        registry.add(std::sync::Arc::new(Named("alpha", 1)));
        registry.add(std::sync::Arc::new(Named("beta", 2)));
        registry.add(std::sync::Arc::new(Named("ALPHA", 9)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        // the replacement stays in the first slot, under the new object
        assert_eq!(snapshot[0].name(), "ALPHA");
        assert_eq!(snapshot[1].name(), "beta");
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let registry = ProtocolRegistry::new();
        registry.add(std::sync::Arc::new(Named("Echo", 1)));

        assert!(registry.find("echo").is_some());
        assert!(registry.find("ECHO").is_some());
        assert!(registry.find("chat").is_none());
    }

    #[test]
    fn test_remove_by_name() {
        let registry = ProtocolRegistry::new();
        registry.add(std::sync::Arc::new(Named("alpha", 1)));
        registry.add(std::sync::Arc::new(Named("beta", 2)));

        assert!(registry.remove("ALPHA"));
        assert!(!registry.remove("alpha"));
        assert_eq!(registry.len(), 1);
        assert!(registry.find("beta").is_some());
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let registry = ProtocolRegistry::new();
        registry.add(std::sync::Arc::new(Named("alpha", 1)));

        let snapshot = registry.snapshot();
        registry.add(std::sync::Arc::new(Named("beta", 2)));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
