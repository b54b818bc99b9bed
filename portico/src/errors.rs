//! Error types for portico

/// Server-side operation errors
///
/// Everything that can go wrong inside the accept pipeline or the server
/// lifecycle. Per-connection failures are reported through the
/// `on_inner_error` hook and never abort the accept loop; only `start()`
/// returns errors synchronously.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no hosts configured")]
    NoHosts,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("accept failed on {addr}: {source}")]
    Accept {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("TLS handshake with {peer} failed: {source}")]
    Tls {
        peer: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("greeting read from {peer} failed: {source}")]
    Greeting {
        peer: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("protocol handshake with {peer} failed: {source}")]
    Handshake {
        peer: std::net::SocketAddr,
        source: ProtocolError,
    },

    #[error("connection handler for {peer} failed: {source}")]
    Connection {
        peer: std::net::SocketAddr,
        source: ProtocolError,
    },

    #[error("write to {peer} failed")]
    Write { peer: std::net::SocketAddr },

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("options error: {0}")]
    Options(String),
}

/// Errors returned by protocol implementations
///
/// Protocols report these from `handshake`, `switch` and `serve`; the
/// framework closes the connection and forwards them through the server's
/// inner-error hook.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}
