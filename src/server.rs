//! TCP listener and per-session receiver loops.
//!
//! The accept loop only accepts. Each accepted connection gets its own task
//! that performs the identity handshake, registers the session, and then
//! becomes that session's receiver loop until the agent goes away or the
//! hub shuts down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};

use crate::config::HubConfig;
use crate::protocol::{self, WireMode};
use crate::session::{DisconnectReason, Session, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

/// Why a new connection never became a session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer closed before sending an identity")]
    Closed,
    #[error("identity not received in time")]
    Timeout,
    #[error("identity is empty")]
    EmptyIdentity,
    #[error("hub is shutting down")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Run the accept loop until shutdown is requested.
///
/// Each accept is bounded by the configured poll interval so the stop flag
/// is checked even when no agent connects. The listener is dropped when the
/// loop exits, which releases the bound address.
pub async fn serve(
    listener: TcpListener,
    registry: SessionRegistry,
    config: Arc<HubConfig>,
    shutdown: ShutdownCoordinator,
) {
    let poll = config.accept_poll_interval();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, wire = ?config.wire, "listening for agents");
    }

    loop {
        if shutdown.is_requested() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("accept loop received stop signal");
                break;
            }
            result = tokio::time::timeout(poll, listener.accept()) => {
                match result {
                    Err(_) => continue,
                    Ok(Ok((stream, addr))) => {
                        tracing::debug!(%addr, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            registry.clone(),
                            config.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Ok(Err(e)) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Backoff to prevent tight loop under sustained accept errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    drop(listener);
    tracing::info!("listener closed");
}

/// Handshake, register, then receive until the session ends.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: SessionRegistry,
    config: Arc<HubConfig>,
    shutdown: ShutdownCoordinator,
) {
    let (mut reader, writer) = stream.into_split();

    let identity = match handshake(&mut reader, &config, &shutdown).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::info!(%addr, error = %e, "handshake failed, discarding connection");
            return;
        }
    };

    let session = Session::new(identity, addr, Box::new(writer));
    match registry.register(&session) {
        Ok(position) => {
            tracing::info!(
                session = %session.id,
                identity = %session.identity,
                %addr,
                position,
                "agent connected"
            );
        }
        Err(e) => {
            tracing::warn!(identity = %session.identity, %addr, error = %e, "refusing agent");
            session.close().await;
            return;
        }
    }

    run_receiver(session, reader, registry, config.wire, config.read_buffer).await;
}

/// Read the agent's identity, bounded by the handshake timeout.
async fn handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &HubConfig,
    shutdown: &ShutdownCoordinator,
) -> Result<String, HandshakeError> {
    let read = protocol::read_identity(reader, config.wire, config.identity_limit);
    let identity = tokio::select! {
        _ = shutdown.cancelled() => return Err(HandshakeError::Cancelled),
        result = tokio::time::timeout(config.handshake_timeout(), read) => {
            result.map_err(|_| HandshakeError::Timeout)??
        }
    };

    match identity {
        None => Err(HandshakeError::Closed),
        Some(identity) if identity.is_empty() => Err(HandshakeError::EmptyIdentity),
        Some(identity) => Ok(identity),
    }
}

/// Forward agent output until EOF, a transport error, or cancellation.
///
/// On EOF or error the session is removed from the registry (which emits
/// the single `Disconnected` event) and its transport is closed. If the
/// session was already taken out by shutdown, nothing further is reported.
/// A stalled agent holds this loop until the transport fails or the hub
/// shuts down; there is no read timeout.
///
/// Returns the reported reason, or `None` if someone else retired the session.
pub async fn run_receiver<R: AsyncRead + Unpin>(
    session: Session,
    mut reader: R,
    registry: SessionRegistry,
    wire: WireMode,
    read_buffer: usize,
) -> Option<DisconnectReason> {
    let mut buf = vec![0u8; read_buffer.max(1)];

    let ended = loop {
        let result = tokio::select! {
            _ = session.cancelled.cancelled() => break None,
            result = protocol::read_output(&mut reader, wire, &mut buf) => result,
        };
        match result {
            Ok(Some(text)) => {
                if !registry.publish_output(&session, text) {
                    break None;
                }
            }
            Ok(None) => break Some(DisconnectReason::Graceful),
            Err(e) => break Some(DisconnectReason::TransportError(e.to_string())),
        }
    };

    let reported = match ended {
        Some(reason) => registry
            .remove(session.id, reason.clone())
            .map(|_| reason),
        None => None,
    };
    session.close().await;

    match &reported {
        Some(reason) => tracing::info!(
            session = %session.id,
            identity = %session.identity,
            addr = %session.addr,
            ?reason,
            "agent disconnected"
        ),
        None => tracing::debug!(
            session = %session.id,
            "receiver stopped after session was retired"
        ),
    }
    reported
}
