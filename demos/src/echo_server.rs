//! Line echo server demo
//!
//! Greet with 'E' and every following line comes back at you.
//!
//! Usage:
//!   echo_server [port]        # default port 2626
//!
//! Try it:
//!   printf 'Ehello\nworld\n' | nc localhost 2626

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
        // skip the replayed 'E' greeting byte
        let mut trigger = [0u8; 1];
        reader.read_exact(&mut trigger).await?;

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            tracing::debug!(peer = %connection.peer_addr(), %line, "echoing");
            let mut out = line.into_bytes();
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

    let server = portico::Server::new(portico::ServerOptions::on_port(port));
    server.use_protocol(EchoProtocol);
    server.on_started(move |_| {
        println!("🎧 echo server listening on port {port} — greet with 'E'");
    });
    server.on_stopped(|_| {
        println!("👋 echo server stopped");
    });

    server.run().await?;
    Ok(())
}
