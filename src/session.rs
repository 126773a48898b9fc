use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::events::{EventSender, HubEvent};

/// Write half of an agent transport.
pub type Transport = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier. Stable for the session's lifetime,
/// unlike its position in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The agent closed the transport (zero-length read).
    Graceful,
    /// Reset, broken pipe, malformed frame, or any other I/O failure.
    TransportError(String),
    /// The hub closed the session while shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Operator-facing line for this disconnect.
    pub fn describe(&self, identity: &str, addr: SocketAddr) -> String {
        match self {
            Self::Graceful => format!("You have disconnected from [{identity}]:{addr}"),
            Self::TransportError(_) => format!("Connection lost with [{identity}]:{addr}"),
            Self::Shutdown => format!("Closed connection with [{identity}]:{addr}"),
        }
    }
}

/// Snapshot of a registered session, safe to hold without any lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub identity: String,
    pub addr: SocketAddr,
}

/// The hub's record of one connected agent.
///
/// Clones share the transport, state, and cancellation token. The read half
/// of the transport is not stored here; the receiver loop owns it.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    /// `user@host`-style identity declared during the handshake.
    pub identity: String,
    pub addr: SocketAddr,
    state: Arc<AtomicU8>,
    writer: Arc<tokio::sync::Mutex<Option<Transport>>>,
    /// Fires when the session is closed. The receiver loop selects on it so
    /// it stops reading as soon as the hub drops the session.
    pub cancelled: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in the `Connecting` state.
    pub fn new(identity: impl Into<String>, addr: SocketAddr, writer: Transport) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            identity: identity.into(),
            addr,
            state: Arc::new(AtomicU8::new(SessionState::Connecting as u8)),
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            identity: self.identity.clone(),
            addr: self.addr,
        }
    }

    /// Write `data` to the agent in one `write_all`.
    ///
    /// Writes are serialized by the transport lock. A write in progress is
    /// abandoned if the session is closed underneath it.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "session transport closed")
            })?;
        tokio::select! {
            _ = self.cancelled.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "session closed during write"))
            }
            result = write_and_flush(writer, data) => result,
        }
    }

    /// Close the transport. Best-effort and idempotent.
    ///
    /// Returns `true` only for the call that actually released the transport.
    pub async fn close(&self) -> bool {
        self.cancelled.cancel();
        let writer = self.writer.lock().await.take();
        self.set_state(SessionState::Closed);
        match writer {
            Some(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(session = %self.id, ?e, "transport shutdown failed");
                }
                true
            }
            None => false,
        }
    }
}

async fn write_and_flush(writer: &mut Transport, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no session at position {position} ({len} connected)")]
    OutOfRange { position: usize, len: usize },
    #[error("registry is closed")]
    Closed,
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

struct RegistryInner {
    sessions: Vec<Session>,
    max_sessions: Option<usize>,
    closed: bool,
}

/// Ordered collection of live sessions.
///
/// Insertion order is the operator's positional view. Every accessor goes
/// through one lock, and connect/disconnect notifications are enqueued while
/// that lock is held, so the observer sees mutations in exactly the order
/// the registry applied them.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events: EventSender,
}

impl SessionRegistry {
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new(events: EventSender) -> Self {
        Self::with_max_sessions(events, Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(events: EventSender, max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: Vec::new(),
                max_sessions,
                closed: false,
            })),
            events,
        }
    }

    /// Append a session, mark it `Active`, and emit `Connected`.
    ///
    /// Returns the session's position. Fails once the registry has been
    /// drained or when it is at capacity.
    pub fn register(&self, session: &Session) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        session.set_state(SessionState::Active);
        inner.sessions.push(session.clone());
        self.events.send(HubEvent::Connected {
            id: session.id,
            identity: session.identity.clone(),
            addr: session.addr,
        });
        Ok(inner.sessions.len() - 1)
    }

    /// Remove a session and emit `Disconnected` with `reason`.
    ///
    /// Removing an absent session is a no-op that returns `None` and emits
    /// nothing, so each session is reported gone exactly once.
    pub fn remove(&self, id: SessionId, reason: DisconnectReason) -> Option<Session> {
        let mut inner = self.inner.write();
        let index = inner.sessions.iter().position(|s| s.id == id)?;
        let session = inner.sessions.remove(index);
        session.set_state(SessionState::Closing);
        self.events.send(HubEvent::Disconnected {
            id: session.id,
            identity: session.identity.clone(),
            addr: session.addr,
            reason,
        });
        Some(session)
    }

    /// Session at `position` in the current order.
    pub fn get(&self, position: usize) -> Result<Session, RegistryError> {
        let inner = self.inner.read();
        inner
            .sessions
            .get(position)
            .cloned()
            .ok_or(RegistryError::OutOfRange {
                position,
                len: inner.sessions.len(),
            })
    }

    /// Ordered snapshot of every registered session.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        inner.sessions.iter().map(Session::info).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Emit an `Output` event for `session` if it is still registered.
    ///
    /// Held under the read lock so no output can be enqueued after the
    /// session's `Disconnected` event. Returns whether the event was sent.
    pub fn publish_output(&self, session: &Session, text: String) -> bool {
        let inner = self.inner.read();
        if !inner.sessions.iter().any(|s| s.id == session.id) {
            return false;
        }
        self.events.send(HubEvent::Output {
            id: session.id,
            identity: session.identity.clone(),
            addr: session.addr,
            text,
        });
        true
    }

    /// Close the registry and take every session out of it.
    ///
    /// Emits `Disconnected { reason: Shutdown }` for each drained session.
    /// Later calls return an empty list. The caller closes the transports.
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.write();
        inner.closed = true;
        let drained: Vec<Session> = inner.sessions.drain(..).collect();
        for session in &drained {
            session.set_state(SessionState::Closing);
            self.events.send(HubEvent::Disconnected {
                id: session.id,
                identity: session.identity.clone(),
                addr: session.addr,
                reason: DisconnectReason::Shutdown,
            });
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventPump};
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn make_session(identity: &str, port: u16) -> Session {
        Session::new(identity, addr(port), Box::new(tokio::io::sink()))
    }

    fn make_registry() -> (SessionRegistry, EventPump) {
        let (tx, pump) = events::channel();
        (SessionRegistry::new(tx), pump)
    }

    fn identities(registry: &SessionRegistry) -> Vec<String> {
        registry.list().into_iter().map(|s| s.identity).collect()
    }

    #[test]
    fn register_preserves_insertion_order() {
        let (registry, _pump) = make_registry();
        let a = make_session("a@h", 1);
        let b = make_session("b@h", 2);
        assert_eq!(registry.register(&a).unwrap(), 0);
        assert_eq!(registry.register(&b).unwrap(), 1);
        assert_eq!(identities(&registry), vec!["a@h", "b@h"]);
        assert_eq!(a.state(), SessionState::Active);
    }

    #[test]
    fn remove_shifts_positions() {
        let (registry, _pump) = make_registry();
        let a = make_session("a@h", 1);
        let b = make_session("b@h", 2);
        registry.register(&a).unwrap();
        registry.register(&b).unwrap();

        registry.remove(a.id, DisconnectReason::Graceful).unwrap();
        assert_eq!(registry.get(0).unwrap().id, b.id);
        assert!(matches!(
            registry.get(1),
            Err(RegistryError::OutOfRange { position: 1, len: 1 })
        ));
        assert_eq!(a.state(), SessionState::Closing);
    }

    #[test]
    fn remove_absent_is_noop() {
        let (registry, mut pump) = make_registry();
        let a = make_session("a@h", 1);
        registry.register(&a).unwrap();
        assert!(registry.remove(a.id, DisconnectReason::Graceful).is_some());
        assert!(registry.remove(a.id, DisconnectReason::Graceful).is_none());

        assert!(matches!(pump.try_recv(), Some(HubEvent::Connected { .. })));
        assert!(matches!(pump.try_recv(), Some(HubEvent::Disconnected { .. })));
        assert!(pump.try_recv().is_none(), "second remove must not notify");
    }

    #[test]
    fn lookup_on_empty_registry_is_out_of_range() {
        let (registry, _pump) = make_registry();
        assert!(matches!(
            registry.get(0),
            Err(RegistryError::OutOfRange { position: 0, len: 0 })
        ));
    }

    #[test]
    fn max_sessions_is_enforced() {
        let (tx, _pump) = events::channel();
        let registry = SessionRegistry::with_max_sessions(tx, Some(1));
        registry.register(&make_session("a@h", 1)).unwrap();
        let err = registry.register(&make_session("b@h", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::MaxSessionsReached));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_closes_registry_and_reports_shutdown() {
        let (registry, mut pump) = make_registry();
        let a = make_session("a@h", 1);
        registry.register(&a).unwrap();
        let _ = pump.try_recv();

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.is_closed());
        match pump.try_recv() {
            Some(HubEvent::Disconnected { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::Shutdown)
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }

        let late = make_session("late@h", 3);
        assert!(matches!(registry.register(&late), Err(RegistryError::Closed)));
        assert!(pump.try_recv().is_none(), "no Connected after drain");
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn output_is_suppressed_after_removal() {
        let (registry, mut pump) = make_registry();
        let a = make_session("a@h", 1);
        registry.register(&a).unwrap();
        assert!(registry.publish_output(&a, "one".into()));
        registry.remove(a.id, DisconnectReason::Graceful);
        assert!(!registry.publish_output(&a, "two".into()));

        let kinds: Vec<_> = std::iter::from_fn(|| pump.try_recv()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[1], HubEvent::Output { ref text, .. } if text == "one"));
        assert!(matches!(kinds[2], HubEvent::Disconnected { .. }));
    }

    #[test]
    fn concurrent_registration_order_matches_event_order() {
        let (registry, mut pump) = make_registry();
        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register(&make_session(&format!("agent{i}@h"), 1000 + i)).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let listed: Vec<SessionId> = registry.list().into_iter().map(|s| s.id).collect();
        let announced: Vec<SessionId> = std::iter::from_fn(|| pump.try_recv())
            .map(|ev| match ev {
                HubEvent::Connected { id, .. } => id,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(listed, announced);
    }

    #[test]
    fn concurrent_register_remove_is_linearizable() {
        const WRITERS: usize = 8;
        const ROUNDS: usize = 50;

        let (registry, mut pump) = make_registry();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let snapshot = registry.list();
                    assert!(snapshot.len() <= WRITERS);
                    let unique: HashSet<_> = snapshot.iter().map(|s| s.id).collect();
                    assert_eq!(unique.len(), snapshot.len(), "duplicate entry observed");
                }
            })
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for r in 0..ROUNDS {
                        let s = make_session(&format!("w{w}r{r}@h"), 2000 + w as u16);
                        registry.register(&s).unwrap();
                        assert!(registry.remove(s.id, DisconnectReason::Graceful).is_some());
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        assert!(registry.is_empty());

        // Replaying the event stream must describe a valid history.
        let mut live = HashSet::new();
        let mut events = 0;
        while let Some(ev) = pump.try_recv() {
            events += 1;
            match ev {
                HubEvent::Connected { id, .. } => assert!(live.insert(id)),
                HubEvent::Disconnected { id, .. } => assert!(live.remove(&id)),
                HubEvent::Output { .. } => unreachable!(),
            }
            assert!(live.len() <= WRITERS);
        }
        assert!(live.is_empty());
        assert_eq!(events, WRITERS * ROUNDS * 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let s = make_session("a@h", 1);
        assert!(s.close().await);
        assert!(!s.close().await);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let s = make_session("a@h", 1);
        s.close().await;
        let err = s.send(b"ls").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn send_writes_to_transport() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(64);
        let s = Session::new("a@h", addr(1), Box::new(client));
        s.send(b"whoami").await.unwrap();

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"whoami");
    }

    #[test]
    fn describe_distinguishes_reasons() {
        let a = addr(5);
        assert!(DisconnectReason::Graceful.describe("u@h", a).starts_with("You have disconnected"));
        assert!(DisconnectReason::TransportError("reset".into())
            .describe("u@h", a)
            .starts_with("Connection lost"));
    }
}
