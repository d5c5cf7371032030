//! TCP listener and gateway wiring.
//!
//! Accepts client connections and spawns a session per socket, runs the
//! dispatcher and registry reaper, and coordinates shutdown.

use crate::config::{Config, ConfigError};
use crate::dispatcher::{Dispatcher, UnsolicitedSink};
use crate::engine::{Engine, EngineAdapter, EngineError, EngineReceiver};
use crate::protocol::{self, CODE_UNAVAILABLE};
use crate::registry::{self, CorrelationRegistry};
use crate::session::{Session, SessionContext, SessionInfo, SessionSettings, SessionTable};
use crate::stats::GatewayStats;
use crate::tag::TagAllocator;
use bytes::BytesMut;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How often shutdown checks whether sessions have drained
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// The registry reaper runs at least this often
const MAX_REAP_PERIOD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("runtime error: {0}")]
    Io(#[from] io::Error),
}

/// Cloneable trigger for gateway shutdown.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Ask every task to stop. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Bind the client-facing listener.
///
/// With `reuse_port` set, another process may bind the same port and the
/// kernel splits incoming connections between them.
pub fn bind(addr: &str, backlog: u32, reuse_port: bool) -> Result<TcpListener, GatewayError> {
    let bind_error = |source| GatewayError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })?;

    let listener = create_listener(socket_addr, backlog, reuse_port).map_err(bind_error)?;
    info!(address = %listener.local_addr()?, "Gateway listening");
    Ok(listener)
}

/// Create a TCP listener with address (and optionally, on unix, port) reuse.
fn create_listener(addr: SocketAddr, backlog: u32, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    if reuse_port {
        warn!("SO_REUSEPORT is not supported on this platform, ignoring");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}

fn lock(sessions: &Mutex<SessionTable>) -> MutexGuard<'_, SessionTable> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gateway instance
pub struct Gateway {
    config: Config,
    ctx: SessionContext,
    receiver: EngineReceiver,
    sessions: Arc<Mutex<SessionTable>>,
    shutdown: Shutdown,
}

impl Gateway {
    /// Create a gateway in front of `engine`.
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Self {
        let (submitter, receiver) = EngineAdapter::new(engine);

        let ctx = SessionContext {
            registry: CorrelationRegistry::new(),
            submitter,
            tags: Arc::new(TagAllocator::new()),
            sink: Arc::new(UnsolicitedSink::new(
                config.unsolicited,
                config.event_capacity,
            )),
            stats: Arc::new(GatewayStats::default()),
            settings: Arc::new(SessionSettings {
                framing: config.framing,
                max_frame_size: config.max_frame_size,
                request_timeout: config.request_timeout,
                tag_field: config.tag_field.clone(),
                queue_depth: config.queue_depth,
            }),
        };

        Self {
            sessions: Arc::new(Mutex::new(SessionTable::new(config.max_connections))),
            config,
            ctx,
            receiver,
            shutdown: Shutdown::new(),
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<CorrelationRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    #[cfg(test)]
    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Serve clients on `listener` until shutdown is triggered.
    pub async fn run(self, listener: TcpListener) -> Result<(), GatewayError> {
        let Gateway {
            config,
            ctx,
            receiver,
            sessions,
            shutdown,
        } = self;

        let dispatcher = Dispatcher::new(
            receiver,
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.tags),
            Arc::clone(&ctx.sink),
            Arc::clone(&ctx.stats),
            config.tag_field.clone(),
            config.poll_interval,
            shutdown.subscribe(),
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        tokio::spawn(registry::cleanup_task(
            Arc::clone(&ctx.registry),
            config.request_timeout.saturating_mul(2),
            config.request_timeout.min(MAX_REAP_PERIOD),
            shutdown.subscribe(),
        ));

        let mut stop = shutdown.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => start_session(stream, peer, &ctx, &sessions, &shutdown),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!("Stopped accepting connections");

        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }
        drain_sessions(&sessions, config.shutdown_grace).await;

        let stats = ctx.stats.snapshot();
        info!(
            connections = stats.connections_accepted,
            rejected = stats.connections_rejected,
            requests = stats.requests,
            responses = stats.responses,
            unsolicited = stats.unsolicited,
            orphaned = stats.orphaned,
            timeouts = stats.timeouts,
            submit_failures = stats.submit_failures,
            overflows = stats.overflows,
            "Gateway stopped"
        );
        Ok(())
    }
}

fn start_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &SessionContext,
    sessions: &Arc<Mutex<SessionTable>>,
    shutdown: &Shutdown,
) {
    let info = SessionInfo {
        peer,
        connected_at: Instant::now(),
    };
    let Some(id) = lock(sessions).insert(info) else {
        warn!(%peer, "Connection limit reached, rejecting");
        ctx.stats.connection_rejected();
        tokio::spawn(reject(stream, Arc::clone(&ctx.settings)));
        return;
    };

    ctx.stats.connection_accepted();
    if let Err(e) = stream.set_nodelay(true) {
        trace!(session = id, error = %e, "Failed to set TCP_NODELAY");
    }
    debug!(session = id, %peer, "New connection");

    let session = Session::new(id, stream, ctx.clone(), shutdown.subscribe());
    let sessions = Arc::clone(sessions);
    tokio::spawn(async move {
        if let Err(e) = session.run().await {
            debug!(session = id, error = %e, "Connection error");
        }
        if let Some(info) = lock(&sessions).remove(id) {
            debug!(
                session = id,
                peer = %info.peer,
                duration = ?info.connected_at.elapsed(),
                "Connection closed"
            );
        }
    });
}

/// Tell a client over the connection limit why it is being dropped.
async fn reject(mut stream: TcpStream, settings: Arc<SessionSettings>) {
    let payload = protocol::error_response(
        &settings.tag_field,
        None,
        CODE_UNAVAILABLE,
        "too many connections",
    );
    let mut out = BytesMut::new();
    settings.framing.encode(payload.as_bytes(), &mut out);

    if let Err(e) = stream.write_all(&out).await {
        trace!(error = %e, "Failed to notify rejected client");
    }
    if let Err(e) = stream.shutdown().await {
        trace!(error = %e, "Failed to close rejected client");
    }
}

/// Wait for sessions to close, up to `grace`.
async fn drain_sessions(sessions: &Mutex<SessionTable>, grace: Duration) {
    // No deadline if the grace period is beyond what an Instant can hold
    let deadline = Instant::now().checked_add(grace);

    loop {
        {
            let table = lock(sessions);
            if table.is_empty() {
                return;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(remaining = table.len(), "Sessions still open after shutdown grace period");
                return;
            }
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}
