//! In-process supervisor: owns the listening socket and the accept loop.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, error, info, warn};

use super::connection;
use super::{Lifecycle, ServerConfig, ServerState};
use crate::error::{Error, Result};
use crate::handler::ObservationHandler;
use crate::telemetry::metrics;
use crate::telemetry::rpc::{record_state_transition, start_connection_span, start_lifecycle_span};

/// Owns one listening socket for its whole life.
///
/// Cheap to clone; clones share the same server. A stopped supervisor
/// cannot be started again; build a new one instead.
pub struct Supervisor<H: ObservationHandler> {
    inner: Arc<Inner<H>>,
}

struct Inner<H> {
    config: ServerConfig,
    handler: Arc<H>,
    /// Held for the whole of `start` and `stop`, which serializes them.
    running: Mutex<Option<Running>>,
    state: watch::Sender<ServerState>,
    local_addr: OnceLock<SocketAddr>,
    span: Span,
}

/// Handles for a bound server.
struct Running {
    /// Stops accepting and closes idle connections.
    shutdown: CancellationToken,
    /// Abandons calls still running after the grace window.
    force: CancellationToken,
    connections: TaskTracker,
    accept: JoinHandle<()>,
}

impl<H: ObservationHandler> Clone for Supervisor<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ObservationHandler> Supervisor<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    pub fn with_shared_handler(config: ServerConfig, handler: Arc<H>) -> Self {
        let (state, _) = watch::channel(ServerState::Unstarted);
        let span = start_lifecycle_span(&config.bind_addr);
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                running: Mutex::new(None),
                state,
                local_addr: OnceLock::new(),
                span,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Port actually bound, once started.
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bind, register the handler and start accepting.
    ///
    /// Returns only after the socket is bound, so a client may connect to
    /// [`port`](Self::port) immediately.
    ///
    /// # Errors
    ///
    /// `Error::Bind` if the address cannot be bound (the supervisor stays
    /// `Unstarted`), `Error::InvalidTransition` if it was already stopped.
    pub async fn start(&self) -> Result<ServerState> {
        // Running and terminal states answer without queueing behind a
        // stop that is still draining.
        let seen = self.state();
        if seen != ServerState::Starting {
            if let Some(settled) = settled_start(seen) {
                return settled;
            }
        }

        let mut running = self.inner.running.lock().await;
        if let Some(settled) = settled_start(self.state()) {
            return settled;
        }

        self.inner.transition(ServerState::Starting);

        let addr = self.inner.config.bind_addr;
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.inner.transition(ServerState::Unstarted);
                return Err(Error::Bind { addr, source });
            }
        };

        self.launch(&mut running, listener, local_addr);
        Ok(ServerState::Running)
    }

    /// Spawn the accept loop over `acceptor` and enter `Running`.
    fn launch<A: Acceptor>(
        &self,
        running: &mut Option<Running>,
        acceptor: A,
        local_addr: SocketAddr,
    ) {
        let _ = self.inner.local_addr.set(local_addr);

        let shutdown = CancellationToken::new();
        let force = CancellationToken::new();
        let connections = TaskTracker::new();

        let accept = tokio::spawn(
            accept_loop(
                Arc::downgrade(&self.inner),
                acceptor,
                shutdown.clone(),
                force.clone(),
                connections.clone(),
            )
            .instrument(self.inner.span.clone()),
        );

        *running = Some(Running {
            shutdown,
            force,
            connections,
            accept,
        });
        self.inner.transition(ServerState::Running);
        self.inner.span.in_scope(|| info!(addr = %local_addr, "server listening"));
    }

    /// Refuse new connections, let in-flight calls finish within `grace`,
    /// then close whatever remains and release the socket.
    ///
    /// # Errors
    ///
    /// Returns an error only if the accept task panicked.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let mut running = self.inner.running.lock().await;

        let Some(handles) = running.take() else {
            // Unstarted, or already stopped.
            if self.state() != ServerState::Stopped {
                self.inner.transition(ServerState::Stopped);
            }
            return Ok(());
        };

        self.inner.transition(ServerState::Stopping);

        handles.shutdown.cancel();
        let accepted = handles.accept.await;

        handles.connections.close();
        if tokio::time::timeout(grace, handles.connections.wait())
            .await
            .is_err()
        {
            self.inner.span.in_scope(|| {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    remaining = handles.connections.len(),
                    "grace window elapsed, closing remaining connections"
                );
            });
            handles.force.cancel();
            handles.connections.wait().await;
        }

        self.inner.transition(ServerState::Stopped);
        self.inner.span.in_scope(|| info!("server stopped"));

        accepted.map_err(|e| Error::Other(format!("accept loop panicked: {e}")))
    }

    /// Resolve once `Stopped` is reached.
    pub async fn await_termination(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }

    /// [`Lifecycle::run_until`] without importing the trait.
    pub async fn run_until<F>(&self, shutdown: F, grace: Duration) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        Lifecycle::run_until(self, shutdown, grace).await
    }
}

impl<H> Inner<H> {
    fn transition(&self, to: ServerState) {
        let from = self.state.send_replace(to);
        record_state_transition(&self.span, from.as_str(), to.as_str());
        metrics::lifecycle_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }
}

impl<H> Drop for Inner<H> {
    fn drop(&mut self) {
        // Last clone gone without a stop: release the socket and connections.
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
            running.force.cancel();
        }
    }
}

/// Outcome of a `start` that needs no binding.
fn settled_start(state: ServerState) -> Option<Result<ServerState>> {
    match state {
        ServerState::Unstarted => None,
        current @ (ServerState::Starting | ServerState::Running) => Some(Ok(current)),
        from @ (ServerState::Stopping | ServerState::Stopped) => Some(Err(Error::InvalidTransition {
            from,
            to: ServerState::Starting,
        })),
    }
}

impl<H: ObservationHandler> Lifecycle for Supervisor<H> {
    async fn start(&self) -> Result<ServerState> {
        Supervisor::start(self).await
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        Supervisor::stop(self, grace).await
    }

    async fn await_termination(&self) {
        Supervisor::await_termination(self).await;
    }

    async fn port(&self) -> Option<u16> {
        Supervisor::port(self)
    }
}

/// Pause after a resource-exhaustion accept error before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections.
trait Acceptor: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFault {
    /// Only the connection being accepted is affected.
    Connection,
    /// Out of descriptors or memory; may clear once connections close.
    Exhausted,
    /// The listener itself is broken.
    Fatal,
}

fn classify(e: &io::Error) -> AcceptFault {
    match e.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => AcceptFault::Connection,
        ErrorKind::OutOfMemory => AcceptFault::Exhausted,
        _ if is_resource_exhaustion(e) => AcceptFault::Exhausted,
        _ => AcceptFault::Fatal,
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_: &io::Error) -> bool {
    false
}

async fn accept_loop<H: ObservationHandler, A: Acceptor>(
    inner: Weak<Inner<H>>,
    acceptor: A,
    shutdown: CancellationToken,
    force: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        let e = match accepted {
            Ok((stream, peer)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let handler = Arc::clone(&inner.handler);
                connections.spawn(
                    connection::serve(stream, handler, shutdown.clone(), force.clone())
                        .instrument(start_connection_span(&peer)),
                );
                continue;
            }
            Err(e) => e,
        };

        match classify(&e) {
            AcceptFault::Connection => {
                warn!(error = %e, "failed to accept connection");
            }
            AcceptFault::Exhausted => {
                warn!(
                    error = %e,
                    backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                    "out of resources accepting connections, backing off"
                );
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            AcceptFault::Fatal => {
                error!(error = %e, "accept loop failed, stopping server");
                if let Some(inner) = inner.upgrade() {
                    let supervisor = Supervisor { inner };
                    let grace = supervisor.config().fault_grace;
                    tokio::spawn(async move {
                        if let Err(e) = supervisor.stop(grace).await {
                            error!(error = %e, "stop after accept fault failed");
                        }
                    });
                }
                break;
            }
        }
    }
    // Dropping the acceptor here releases the port.
}
