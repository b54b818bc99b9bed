//! Two protocols on one port, with heartbeat
//!
//! Demonstrates what the framework is for: a single accept loop serving
//! multiple wire protocols, chosen by the first greeting byte.
//!
//!   - 'E' → line echo
//!   - 'U' → shouting echo (uppercased lines) with ping/pong heartbeat
//!
//! Usage:
//!   multi_protocol [port]     # default port 2626

use tokio::io::{AsyncBufReadExt, AsyncReadExt};

struct EchoProtocol;

#[async_trait::async_trait]
impl portico::Protocol for EchoProtocol {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handshake(
        &self,
        _connection: &std::sync::Arc<portico::Connection>,
        greeting: &[u8],
    ) -> Result<portico::Handshake, portico::ProtocolError> {
        if greeting.first() == Some(&b'E') {
            Ok(portico::Handshake::with_reply("OK\n"))
        } else {
            Ok(portico::Handshake::Rejected)
        }
    }

    async fn serve(
        &self,
        connection: std::sync::Arc<portico::Connection>,
        stream: portico::ConnectionStream,
    ) -> Result<(), portico::ProtocolError> {
        let mut reader = tokio::io::BufReader::new(stream);
        let mut trigger = [0u8; 1];
        reader.read_exact(&mut trigger).await?;

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let mut out = line.into_bytes();
            out.push(b'\n');
            if !connection.send(&out).await {
                break;
            }
        }
        Ok(())
    }
}

/// Heartbeat-aware socket: pings as "PING\n" lines, answers with "PONG\n"
struct ShoutSocket {
    connection: std::sync::Weak<portico::Connection>,
}

#[async_trait::async_trait]
impl portico::ProtocolSocket for ShoutSocket {
    async fn ping(&self) -> bool {
        match self.connection.upgrade() {
            Some(connection) => connection.send(b"PING\n").await,
            None => false,
        }
    }

    async fn pong(&self, _payload: Option<bytes::Bytes>) -> bool {
        match self.connection.upgrade() {
            Some(connection) => connection.send(b"PONG\n").await,
            None => false,
        }
    }

    fn heartbeat(&self) -> bool {
        true
    }

    fn on_connected(&self) {
        if let Some(connection) = self.connection.upgrade() {
            tracing::info!(peer = %connection.peer_addr(), "shouter joined");
        }
    }

    fn on_disconnected(&self) {
        tracing::info!("shouter left");
    }
}

struct ShoutProtocol;

#[async_trait::async_trait]
impl portico::Protocol for ShoutProtocol {
    fn name(&self) -> &str {
        "shout"
    }

    async fn handshake(
        &self,
        connection: &std::sync::Arc<portico::Connection>,
        greeting: &[u8],
    ) -> Result<portico::Handshake, portico::ProtocolError> {
        if greeting.first() != Some(&b'U') {
            return Ok(portico::Handshake::Rejected);
        }
        connection.set_smart_health_check(true);
        Ok(portico::Handshake::Accepted {
            reply: Some(bytes::Bytes::from_static(b"SHOUT\n")),
            socket: Some(std::sync::Arc::new(ShoutSocket {
                connection: std::sync::Arc::downgrade(connection),
            })),
        })
    }

    async fn serve(
        &self,
        connection: std::sync::Arc<portico::Connection>,
        stream: portico::ConnectionStream,
    ) -> Result<(), portico::ProtocolError> {
        let mut reader = tokio::io::BufReader::new(stream);
        let mut trigger = [0u8; 1];
        reader.read_exact(&mut trigger).await?;

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            connection.keep_alive();
            if line == "PONG" {
                continue;
            }
            let mut out = line.to_uppercase().into_bytes();
            out.push(b'\n');
            if !connection.send(&out).await {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(2626);

    let options = portico::ServerOptions {
        ping_interval: 30,
        ..portico::ServerOptions::on_port(port)
    };

    let server = portico::Server::new(options);
    server.use_protocol(EchoProtocol);
    server.use_protocol(ShoutProtocol);
    server.on_started(move |server| {
        println!(
            "🚀 serving {} protocols on port {port} — greet with 'E' or 'U'",
            server.registry().len()
        );
    });
    server.on_inner_error(|_, error| {
        tracing::warn!(%error, "connection trouble");
    });

    server.run().await?;
    Ok(())
}
