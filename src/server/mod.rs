//! Server lifecycle: socket ownership, start/stop, termination waiting.
//!
//! [`Supervisor`] runs the accept loop in-process. [`ActorHandle`] hosts a
//! supervisor inside a command-driven task. Both implement [`Lifecycle`],
//! the only surface a hosting layer needs.

pub mod actor;
mod connection;
pub mod supervisor;

use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::error::Result;

pub use actor::{ActorHandle, spawn_actor};
pub use supervisor::Supervisor;

/// Lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor settings fixed at construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Grace window used when the host asks for shutdown.
    pub grace: Duration,
    /// Grace window for the internal stop after an accept-loop fault.
    pub fault_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv6Addr::UNSPECIFIED, 50052)),
            grace: Duration::from_secs(1),
            fault_grace: Duration::from_millis(250),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Start/stop/await surface shared by every hosting strategy.
pub trait Lifecycle: Send + Sync {
    /// Bind and begin accepting. A no-op returning the current state when
    /// already starting or running.
    fn start(&self) -> impl Future<Output = Result<ServerState>> + Send;

    /// Drain in-flight calls for up to `grace`, then close everything.
    /// A no-op once stopped.
    fn stop(&self, grace: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Resolve once the server reaches `Stopped`, whatever triggered it.
    fn await_termination(&self) -> impl Future<Output = ()> + Send;

    /// Bound port, once running.
    fn port(&self) -> impl Future<Output = Option<u16>> + Send;

    /// Wait for termination, turning `shutdown` into a `stop(grace)` so the
    /// host never blocks unboundedly.
    fn run_until<F>(&self, shutdown: F, grace: Duration) -> impl Future<Output = Result<()>> + Send
    where
        F: Future<Output = ()> + Send,
    {
        async move {
            tokio::select! {
                () = self.await_termination() => Ok(()),
                () = shutdown => {
                    tracing::info!(grace_ms = grace.as_millis() as u64, "shutdown requested");
                    self.stop(grace).await
                }
            }
        }
    }
}
