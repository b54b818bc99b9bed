//! The accept pipeline
//!
//! Runs once per accepted socket, on its own task: socket options → Pending
//! connection in the keep-alive scope → optional TLS → greeting peek →
//! ordered protocol match → install, reply, serve. Every failure path closes
//! the connection idempotently and reports through the server's inner-error
//! hook; nothing in here can stop the accept loop.

use crate::connection::Transport;

/// Entry point spawned by the accept loop
pub(crate) async fn pipeline(
    listener: std::sync::Arc<crate::server::HostListener>,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) {
    // server already torn down: treat as stopped and drop the attempt
    let Some(server) = listener.server() else {
        return;
    };

    if let Err(error) = run(&server, &listener, stream, peer).await {
        server.report(&error);
    }
}

async fn run(
    server: &std::sync::Arc<crate::Server>,
    listener: &std::sync::Arc<crate::server::HostListener>,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> Result<(), crate::ServerError> {
    let config = listener.config;

    // 1. transport options
    if let Err(error) = stream.set_nodelay(config.no_delay) {
        tracing::debug!(%peer, %error, "set_nodelay failed");
    }
    if config.quick_ack {
        set_quick_ack(&stream);
    }

    // 2. Pending connection under the keep-alive deadline
    let connection = crate::Connection::new(
        peer,
        listener.local_addr(),
        listener.tls.is_some(),
        std::sync::Arc::downgrade(listener),
        config.request_timeout,
    );
    listener.scope.insert(connection.clone());
    tracing::debug!(id = connection.id(), %peer, "accepted");

    // 3. TLS
    let transport = match &listener.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Transport::Tls(Box::new(tls)),
            Err(source) => {
                close_pending(listener, &connection).await;
                return Err(crate::ServerError::Tls { peer, source });
            }
        },
        None => Transport::Plain(stream),
    };

    let mut reader = connection.install_transport(transport).await;

    // 4. greeting peek
    let greeting = match crate::Connection::peek_greeting(&mut reader).await {
        Ok(greeting) => greeting,
        Err(source) => {
            close_pending(listener, &connection).await;
            return Err(crate::ServerError::Greeting { peer, source });
        }
    };
    if greeting.is_empty() {
        // peer closed without sending anything; a normal outcome
        tracing::debug!(id = connection.id(), %peer, "closed before greeting");
        close_pending(listener, &connection).await;
        return Ok(());
    }

    // 5. ordered protocol match
    connection.advance(crate::ConnectionState::Handshaking);
    let registry = server.registry().snapshot();
    for protocol in registry.iter() {
        match protocol.handshake(&connection, &greeting).await {
            Ok(crate::Handshake::Accepted { reply, socket }) => {
                return serve_matched(
                    server, listener, connection, protocol, socket, reply, greeting, reader,
                )
                .await;
            }
            Ok(crate::Handshake::Rejected) => continue,
            Err(source) => {
                close_pending(listener, &connection).await;
                return Err(crate::ServerError::Handshake { peer, source });
            }
        }
    }

    // 6. nobody recognized the greeting
    tracing::warn!(id = connection.id(), %peer, "no protocol recognized the greeting");
    close_pending(listener, &connection).await;
    Ok(())
}

/// Install the winning protocol and run its service loop
#[allow(clippy::too_many_arguments)]
async fn serve_matched(
    server: &std::sync::Arc<crate::Server>,
    listener: &std::sync::Arc<crate::server::HostListener>,
    connection: std::sync::Arc<crate::Connection>,
    protocol: &std::sync::Arc<dyn crate::Protocol>,
    socket: Option<std::sync::Arc<dyn crate::ProtocolSocket>>,
    reply: Option<bytes::Bytes>,
    greeting: bytes::Bytes,
    reader: tokio::io::ReadHalf<Transport>,
) -> Result<(), crate::ServerError> {
    let peer = connection.peer_addr();

    // the reaper may have force-closed us during a slow handshake
    if !connection.advance(crate::ConnectionState::Connected) {
        listener.scope.remove(&connection);
        return Ok(());
    }

    connection.install(protocol.clone(), socket);
    if let Some(socket) = connection.socket() {
        socket.on_connected();
    }

    // the handshake reply goes out before serve can write anything
    if let Some(reply) = reply {
        if !connection.send(&reply).await {
            listener.scope.remove(&connection);
            return Err(crate::ServerError::Write { peer });
        }
    }

    // handed over: the protocol owns liveness from here on
    listener.scope.remove(&connection);
    server.enroll_heartbeat(&connection);

    tracing::debug!(
        id = connection.id(),
        %peer,
        protocol = protocol.name(),
        "protocol matched"
    );

    let stream = crate::ConnectionStream::new(greeting, reader);
    let result = protocol.serve(connection.clone(), stream).await;
    connection.disconnect().await;

    result.map_err(|source| crate::ServerError::Connection { peer, source })
}

async fn close_pending(
    listener: &std::sync::Arc<crate::server::HostListener>,
    connection: &std::sync::Arc<crate::Connection>,
) {
    connection.disconnect().await;
    listener.scope.remove(connection);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_quick_ack(stream: &tokio::net::TcpStream) {
    let socket = socket2::SockRef::from(stream);
    if let Err(error) = socket.set_quickack(true) {
        tracing::debug!(%error, "quick-ack not applied");
    }
}

/// Platform hint only; a no-op where the OS has no equivalent
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_quick_ack(_stream: &tokio::net::TcpStream) {}
