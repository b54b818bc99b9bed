//! # portico
//!
//! Multi-protocol TCP server framework: one accept loop, one TLS layer, one
//! connection registry, pluggable application protocols.
//!
//! A `Server` binds one or more host endpoints, accepts connections
//! (optionally wrapping them in TLS), peeks the first few bytes of each
//! stream and asks the registered protocols — in registration order — which
//! of them owns it. The winning protocol gets the connection plus the peeked
//! bytes replayed at the head of its input, and serves it for the rest of
//! its life. The framework keeps unhandshaken connections on a deadline and
//! optionally heartbeats the connected ones.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portico::{Handshake, Protocol, ProtocolError};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Protocol for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn handshake(
//!         &self,
//!         _connection: &std::sync::Arc<portico::Connection>,
//!         greeting: &[u8],
//!     ) -> Result<Handshake, ProtocolError> {
//!         if greeting.first() == Some(&b'E') {
//!             Ok(Handshake::with_reply("OK\n"))
//!         } else {
//!             Ok(Handshake::Rejected)
//!         }
//!     }
//!
//!     async fn serve(
//!         &self,
//!         connection: std::sync::Arc<portico::Connection>,
//!         stream: portico::ConnectionStream,
//!     ) -> Result<(), ProtocolError> {
//!         // line-by-line echo over `stream` / `connection.send(..)`
//!         # let _ = (connection, stream);
//!         Ok(())
//!     }
//! }
//!
//! # async fn start() -> Result<(), portico::ServerError> {
//! let server = portico::Server::new(portico::ServerOptions::on_port(2626));
//! server.use_protocol(Echo);
//! server.run().await
//! # }
//! ```

mod connection;
mod coordination;
mod errors;
mod options;
mod protocol;
pub mod server;
mod tls;

pub use connection::{Connection, ConnectionState, ConnectionStream, GREETING_LEN};
pub use errors::{ProtocolError, ServerError};
pub use options::{HostOptions, ServerOptions, TlsVersion};
pub use protocol::{Handshake, Protocol, ProtocolRegistry, ProtocolSocket, SwitchData};
pub use server::{HostListener, Server};
