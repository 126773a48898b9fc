use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::events::EventSender;
use crate::server;
use crate::session::{SessionInfo, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A running hub: the bound listener, the session registry, and the
/// operator-facing `dispatch`/`shutdown` surface.
pub struct Hub {
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    shutdown: ShutdownCoordinator,
    local_addr: SocketAddr,
    listener_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Bind the listener and start accepting agents.
    ///
    /// Notifications are sent on `events`. A bind failure is fatal; nothing
    /// is retried.
    pub async fn start(config: HubConfig, events: EventSender) -> Result<Self, HubError> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| HubError::Bind { addr: config.bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HubError::Bind { addr: config.bind, source })?;

        let registry = SessionRegistry::with_max_sessions(events, Some(config.max_sessions));
        let dispatcher = Dispatcher::new(registry.clone(), config.wire);
        let shutdown = ShutdownCoordinator::new();

        let task = tokio::spawn(server::serve(
            listener,
            registry.clone(),
            Arc::new(config),
            shutdown.clone(),
        ));

        Ok(Self {
            registry,
            dispatcher,
            shutdown,
            local_addr,
            listener_task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// The address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ordered snapshot of connected agents; index is the dispatch position.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Send a command to the agent at `position`. See [`Dispatcher::dispatch`].
    pub async fn dispatch(&self, position: usize, command: &str) -> DispatchOutcome {
        self.dispatcher.dispatch(position, command).await
    }

    /// Stop accepting, close every session, and release the listener.
    ///
    /// Never fails. Only the first call does the work; concurrent and later
    /// calls wait until it has finished.
    pub async fn shutdown(&self) {
        if !self.shutdown.request() {
            tracing::debug!("shutdown already requested, waiting for it to finish");
            self.shutdown.finished().await;
            return;
        }
        tracing::info!("shutting down hub");

        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }

        let task = self.listener_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(?e, "listener task ended abnormally");
            }
        }
        self.shutdown.finish();
        tracing::info!(closed = count, "hub stopped");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
