//! Actor hosting: a task that owns a [`Supervisor`] and serves lifecycle
//! commands sent through an [`ActorHandle`].
//!
//! Starts run inline so a `port` query sent after `start` sees the bound
//! port. Stops and termination waits run in their own tasks, so the actor
//! keeps answering while a stop drains. When every handle is dropped the
//! actor stops its server with the configured grace.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info_span};

use super::{Lifecycle, ServerState, Supervisor};
use crate::error::{Error, Result};
use crate::handler::ObservationHandler;

const MAILBOX_CAPACITY: usize = 32;

enum Command {
    Start(oneshot::Sender<Result<ServerState>>),
    Stop {
        grace: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    AwaitTermination(oneshot::Sender<()>),
    Port(oneshot::Sender<Option<u16>>),
    State(oneshot::Sender<ServerState>),
}

/// Cloneable address of a lifecycle actor.
#[derive(Clone)]
pub struct ActorHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
}

/// Spawn an actor that owns `supervisor`.
pub fn spawn_actor<H: ObservationHandler>(
    name: impl Into<String>,
    supervisor: Supervisor<H>,
) -> ActorHandle {
    let name: Arc<str> = Arc::from(name.into());
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let span = info_span!("lifecycle.actor", "actor.name" = %name);
    tokio::spawn(run(supervisor, rx).instrument(span));
    ActorHandle { name, tx }
}

async fn run<H: ObservationHandler>(supervisor: Supervisor<H>, mut rx: mpsc::Receiver<Command>) {
    debug!("actor started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(supervisor.start().await);
            }
            Command::Stop { grace, reply } => {
                let supervisor = supervisor.clone();
                tokio::spawn(
                    async move {
                        let _ = reply.send(supervisor.stop(grace).await);
                    }
                    .in_current_span(),
                );
            }
            Command::AwaitTermination(reply) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    supervisor.await_termination().await;
                    let _ = reply.send(());
                });
            }
            Command::Port(reply) => {
                let _ = reply.send(supervisor.port());
            }
            Command::State(reply) => {
                let _ = reply.send(supervisor.state());
            }
        }
    }

    debug!("all handles dropped, stopping server");
    let grace = supervisor.config().grace;
    if let Err(e) = supervisor.stop(grace).await {
        error!(error = %e, "stop on actor exit failed");
    }
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::ActorGone)?;
        rx.await.map_err(|_| Error::ActorGone)
    }

    /// # Errors
    ///
    /// The supervisor's start error, or `Error::ActorGone`.
    pub async fn start(&self) -> Result<ServerState> {
        self.call(Command::Start).await?
    }

    /// # Errors
    ///
    /// The supervisor's stop error, or `Error::ActorGone`.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.call(|reply| Command::Stop { grace, reply }).await?
    }

    /// Resolves on `Stopped`, or immediately if the actor is gone.
    pub async fn await_termination(&self) {
        let _ = self.call(Command::AwaitTermination).await;
    }

    pub async fn port(&self) -> Option<u16> {
        self.call(Command::Port).await.ok().flatten()
    }

    /// # Errors
    ///
    /// `Error::ActorGone` if the actor has exited.
    pub async fn state(&self) -> Result<ServerState> {
        self.call(Command::State).await
    }
}

impl Lifecycle for ActorHandle {
    async fn start(&self) -> Result<ServerState> {
        ActorHandle::start(self).await
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        ActorHandle::stop(self, grace).await
    }

    async fn await_termination(&self) {
        ActorHandle::await_termination(self).await;
    }

    async fn port(&self) -> Option<u16> {
        ActorHandle::port(self).await
    }
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
