use crate::protocol::{self, Frame, WireMode};
use crate::session::SessionRegistry;

/// What happened to a dispatched command. None of these are errors: the
/// channel is fire-and-forget and a vanished target is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command was written to the transport. Delivery is not confirmed.
    Sent,
    /// Empty command text; nothing was written.
    EmptyCommand,
    /// No session at that position (it disconnected after being selected).
    TargetGone,
    /// The command does not fit in one frame; nothing was written.
    TooLarge,
    /// The session was found but the write failed.
    WriteFailed,
}

/// Sends operator commands to sessions chosen by position.
#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    wire: WireMode,
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry, wire: WireMode) -> Self {
        Self { registry, wire }
    }

    /// Send `command` to the session currently at `position`.
    ///
    /// The position is resolved at call time, so if the registry shrank since
    /// the operator picked it the command goes to whoever holds that position
    /// now, or nowhere. The registry lock is not held during the write.
    pub async fn dispatch(&self, position: usize, command: &str) -> DispatchOutcome {
        if command.is_empty() {
            return DispatchOutcome::EmptyCommand;
        }
        if self.wire == WireMode::Framed && !Frame::fits(command.len()) {
            tracing::debug!(bytes = command.len(), "command too large for one frame");
            return DispatchOutcome::TooLarge;
        }

        let session = match self.registry.get(position) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(position, error = %e, "dispatch target gone");
                return DispatchOutcome::TargetGone;
            }
        };

        let payload = protocol::encode_command(command, self.wire);
        match session.send(&payload).await {
            Ok(()) => {
                tracing::debug!(
                    session = %session.id,
                    identity = %session.identity,
                    bytes = payload.len(),
                    "command dispatched"
                );
                DispatchOutcome::Sent
            }
            Err(e) => {
                tracing::debug!(session = %session.id, ?e, "dispatch write failed");
                DispatchOutcome::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::protocol::{FrameType, MAX_PAYLOAD_SIZE};
    use crate::session::{DisconnectReason, Session};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 1, 1], port))
    }

    fn piped_session(identity: &str, port: u16) -> (Session, DuplexStream) {
        let (hub_side, agent_side) = tokio::io::duplex(1024);
        (Session::new(identity, addr(port), Box::new(hub_side)), agent_side)
    }

    #[tokio::test]
    async fn empty_command_writes_nothing() {
        let (tx, mut pump) = events::channel();
        let registry = SessionRegistry::new(tx);
        let (session, mut agent) = piped_session("a@h", 1);
        registry.register(&session).unwrap();
        let _ = pump.try_recv();

        let dispatcher = Dispatcher::new(registry, WireMode::Raw);
        assert_eq!(dispatcher.dispatch(0, "").await, DispatchOutcome::EmptyCommand);

        session.close().await;
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(pump.try_recv().is_none());
    }

    #[tokio::test]
    async fn out_of_range_is_silent() {
        let (tx, _pump) = events::channel();
        let registry = SessionRegistry::new(tx);
        let (session, _agent) = piped_session("a@h", 1);
        registry.register(&session).unwrap();

        let dispatcher = Dispatcher::new(registry.clone(), WireMode::Framed);
        assert_eq!(dispatcher.dispatch(5, "uptime").await, DispatchOutcome::TargetGone);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn position_resolves_against_current_order() {
        let (tx, _pump) = events::channel();
        let registry = SessionRegistry::new(tx);
        let (a, _agent_a) = piped_session("a@h", 1);
        let (b, mut agent_b) = piped_session("b@h", 2);
        registry.register(&a).unwrap();
        registry.register(&b).unwrap();
        registry.remove(a.id, DisconnectReason::Graceful);

        let dispatcher = Dispatcher::new(registry, WireMode::Framed);
        assert_eq!(dispatcher.dispatch(0, "hostname").await, DispatchOutcome::Sent);

        let frame = Frame::read_from(&mut agent_b).await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Command);
        assert_eq!(frame.text_lossy(), "hostname");
    }

    #[tokio::test]
    async fn write_to_closed_session_is_swallowed() {
        let (tx, _pump) = events::channel();
        let registry = SessionRegistry::new(tx);
        let (session, _agent) = piped_session("a@h", 1);
        registry.register(&session).unwrap();
        session.close().await;

        let dispatcher = Dispatcher::new(registry, WireMode::Raw);
        assert_eq!(dispatcher.dispatch(0, "ls").await, DispatchOutcome::WriteFailed);
    }

    #[tokio::test]
    async fn oversize_command_is_refused() {
        let (tx, _pump) = events::channel();
        let registry = SessionRegistry::new(tx);
        let (session, mut agent) = piped_session("a@h", 1);
        registry.register(&session).unwrap();

        let dispatcher = Dispatcher::new(registry, WireMode::Framed);
        let command = "x".repeat(MAX_PAYLOAD_SIZE as usize + 1);
        assert_eq!(dispatcher.dispatch(0, &command).await, DispatchOutcome::TooLarge);

        session.close().await;
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
