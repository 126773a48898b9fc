//! Notification boundary between the network tasks and the observer.
//!
//! Network tasks never touch observer state. They enqueue [`HubEvent`]s on an
//! unbounded channel; the observer drains that channel on its own loop via
//! [`EventPump`], so every callback runs on the observer's side only.

use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::session::{DisconnectReason, SessionId};

/// A notification produced by the hub core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    Connected {
        id: SessionId,
        identity: String,
        addr: SocketAddr,
    },
    Disconnected {
        id: SessionId,
        identity: String,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// One fragment of agent output. In raw wire mode a fragment is not a
    /// complete message.
    Output {
        id: SessionId,
        identity: String,
        addr: SocketAddr,
        text: String,
    },
}

/// Consumer of hub notifications. Always invoked from the thread or task
/// that drives the [`EventPump`].
pub trait Observer {
    fn on_connected(&mut self, identity: &str, addr: SocketAddr);
    fn on_disconnected(&mut self, identity: &str, addr: SocketAddr, reason: &DisconnectReason);
    fn on_output(&mut self, identity: &str, addr: SocketAddr, text: &str);
}

/// Producer half handed to the hub core. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl EventSender {
    /// Enqueue an event. Never blocks; dropped silently if the observer is gone.
    pub fn send(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped, discarding notification");
        }
    }
}

/// Consumer half, owned by the observer's loop.
pub struct EventPump {
    rx: mpsc::UnboundedReceiver<HubEvent>,
}

/// Create a connected sender/pump pair.
pub fn channel() -> (EventSender, EventPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventPump { rx })
}

impl EventPump {
    /// Wait for the next event. Returns `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Take the next queued event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    /// Deliver every event until all senders are dropped.
    pub async fn run<O: Observer>(mut self, observer: &mut O) {
        while let Some(event) = self.rx.recv().await {
            deliver(observer, &event);
        }
    }

    /// Deliver whatever is already queued without waiting.
    ///
    /// For observers that own a foreign event loop and poll on a timer.
    /// Returns the number of events delivered.
    pub fn poll_pending<O: Observer>(&mut self, observer: &mut O) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.try_recv() {
            deliver(observer, &event);
            delivered += 1;
        }
        delivered
    }
}

/// Route one event to the matching observer callback.
pub fn deliver<O: Observer + ?Sized>(observer: &mut O, event: &HubEvent) {
    match event {
        HubEvent::Connected { identity, addr, .. } => observer.on_connected(identity, *addr),
        HubEvent::Disconnected { identity, addr, reason, .. } => {
            observer.on_disconnected(identity, *addr, reason)
        }
        HubEvent::Output { identity, addr, text, .. } => observer.on_output(identity, *addr, text),
    }
}
