//! Per-client connection sessions.
//!
//! A session reads framed requests from its socket, tags each one, hands it
//! to the engine and waits on its private queue for the dispatcher to bring
//! the matching response back. Requests are strictly serialized: request
//! N+1 is not read off the buffer until response N was written or timed out.
//!
//! ```text
//! Open -> Reading -> (Submitting -> AwaitingReply)* -> Closing -> Closed
//! ```

use crate::dispatcher::UnsolicitedSink;
use crate::engine::EngineSubmitter;
use crate::framing::{FrameError, Framing};
use crate::protocol::{self, Request, CODE_BAD_REQUEST, CODE_TIMEOUT, CODE_UNAVAILABLE};
use crate::registry::{CorrelationRegistry, Delivery, SessionId};
use crate::stats::GatewayStats;
use crate::tag::{Tag, TagAllocator};
use bytes::BytesMut;
use slab::Slab;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, trace, warn};

/// Initial read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// How long a response the dispatcher already claimed may take to land
/// after the session's deadline passed.
const IN_FLIGHT_GRACE: Duration = Duration::from_millis(50);

/// Request timeouts are capped here so deadlines never overflow
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Per-session knobs, shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub framing: Framing,
    pub max_frame_size: usize,
    pub request_timeout: Duration,
    pub tag_field: String,
    pub queue_depth: usize,
}

/// Handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<CorrelationRegistry>,
    pub submitter: EngineSubmitter,
    pub tags: Arc<TagAllocator>,
    pub sink: Arc<UnsolicitedSink>,
    pub stats: Arc<GatewayStats>,
    pub settings: Arc<SessionSettings>,
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Reading,
    Submitting,
    AwaitingReply,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Whether the session keeps serving after a request.
enum Flow {
    Continue,
    Close,
}

enum ReplyOutcome {
    Reply(Delivery),
    TimedOut,
    Shutdown,
}

/// One client connection.
pub struct Session<S> {
    id: SessionId,
    stream: S,
    ctx: SessionContext,
    state: SessionState,
    pending: HashSet<Tag>,
    deliver: mpsc::Sender<Delivery>,
    outbound: mpsc::Receiver<Delivery>,
    events: Option<broadcast::Receiver<Arc<str>>>,
    shutdown: watch::Receiver<bool>,
    /// Client shut down its write side; buffered frames are still served
    read_closed: bool,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: SessionId,
        stream: S,
        ctx: SessionContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (deliver, outbound) = mpsc::channel(ctx.settings.queue_depth.max(1));
        let events = ctx.sink.subscribe();

        Self {
            id,
            stream,
            ctx,
            state: SessionState::Open,
            pending: HashSet::new(),
            deliver,
            outbound,
            events,
            shutdown,
            read_closed: false,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Serve the connection until the client leaves, a fatal error occurs
    /// or the gateway shuts down. Always purges this session's tags.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.serve().await;

        if let Err(SessionError::Frame(e)) = &result {
            warn!(session = self.id, error = %e, "Closing connection on bad frame");
            let diagnostic = protocol::error_response(
                &self.ctx.settings.tag_field,
                None,
                CODE_BAD_REQUEST,
                &e.to_string(),
            );
            if let Err(e) = self.write_payload(diagnostic.as_bytes()).await {
                trace!(session = self.id, error = %e, "Could not send diagnostic");
            }
        }

        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let settings = Arc::clone(&self.ctx.settings);

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            if let Some(frame) = settings
                .framing
                .decode(&mut self.read_buf, settings.max_frame_size)?
            {
                match self.handle_request(&frame).await? {
                    Flow::Continue => continue,
                    Flow::Close => return Ok(()),
                }
            }

            if self.read_closed {
                trace!(session = self.id, "Client finished sending, closing");
                return Ok(());
            }

            self.state = SessionState::Reading;
            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        trace!(session = self.id, "Connection closed by client");
                        return Ok(());
                    }
                }
                event = next_event(&mut self.events) => {
                    self.write_payload(event.as_bytes()).await?;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, frame: &[u8]) -> Result<Flow, SessionError> {
        let settings = Arc::clone(&self.ctx.settings);
        let field = settings.tag_field.as_str();

        self.state = SessionState::Submitting;
        let request = Request::parse(frame)?;
        self.discard_stale();

        let tag = self.register_tag();
        let tagged = request.tagged(field, tag);

        if let Err(e) = self.ctx.submitter.submit(&tagged.payload) {
            self.forget(tag);
            self.ctx.stats.submit_failed();
            warn!(session = self.id, %tag, error = %e, "Engine did not accept request");
            let reply = protocol::error_response(
                field,
                tagged.client_tag.as_ref(),
                CODE_UNAVAILABLE,
                &e.to_string(),
            );
            self.write_payload(reply.as_bytes()).await?;
            return Ok(Flow::Continue);
        }
        self.ctx.stats.request_submitted();
        trace!(session = self.id, %tag, "Submitted request");

        self.state = SessionState::AwaitingReply;
        let reply = match self.await_reply(tag, settings.request_timeout).await? {
            ReplyOutcome::Reply(delivery) => {
                protocol::restore_tag(&delivery.payload, field, tagged.client_tag.as_ref())
            }
            ReplyOutcome::TimedOut => {
                self.ctx.stats.timed_out();
                warn!(
                    session = self.id,
                    %tag,
                    timeout = ?settings.request_timeout,
                    "Request timed out"
                );
                protocol::error_response(
                    field,
                    tagged.client_tag.as_ref(),
                    CODE_TIMEOUT,
                    "request timed out",
                )
            }
            ReplyOutcome::Shutdown => return Ok(Flow::Close),
        };
        self.pending.remove(&tag);

        self.write_payload(reply.as_bytes()).await?;
        Ok(Flow::Continue)
    }

    /// Mint and register a tag, regenerating on the (impossible with a
    /// monotonic allocator) duplicate.
    fn register_tag(&mut self) -> Tag {
        loop {
            let tag = self.ctx.tags.next();
            match self
                .ctx
                .registry
                .register(tag, self.id, self.deliver.clone())
            {
                Ok(()) => {
                    self.pending.insert(tag);
                    return tag;
                }
                Err(e) => {
                    error!(session = self.id, error = %e, "Correlation invariant violated, regenerating tag");
                }
            }
        }
    }

    fn forget(&mut self, tag: Tag) {
        self.ctx.registry.remove(tag);
        self.pending.remove(&tag);
    }

    /// Drop responses to earlier, already answered-by-timeout requests.
    fn discard_stale(&mut self) {
        while let Ok(stale) = self.outbound.try_recv() {
            debug!(session = self.id, tag = %stale.tag, "Discarding stale response");
        }
    }

    async fn await_reply(
        &mut self,
        tag: Tag,
        timeout: Duration,
    ) -> Result<ReplyOutcome, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout.min(FAR_FUTURE);
        let read_limit = self.ctx.settings.max_frame_size;

        loop {
            tokio::select! {
                delivery = self.outbound.recv() => match delivery {
                    Some(delivery) if delivery.tag == tag => return Ok(ReplyOutcome::Reply(delivery)),
                    Some(stale) => {
                        debug!(session = self.id, tag = %stale.tag, "Discarding stale response");
                    }
                    None => return Ok(ReplyOutcome::Shutdown),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.expire(tag).await);
                }
                // Watch for the client leaving; pipelined bytes stay buffered.
                // A reset surfaces as a read error and ends the session.
                read = self.stream.read_buf(&mut self.read_buf), if !self.read_closed && self.read_buf.len() <= read_limit => {
                    if read? == 0 {
                        debug!(session = self.id, %tag, "Client half-closed with a request in flight");
                        self.read_closed = true;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(ReplyOutcome::Shutdown);
                    }
                }
            }
        }
    }

    /// Deadline passed: withdraw the tag, unless the dispatcher already
    /// claimed it, in which case the response is about to land.
    async fn expire(&mut self, tag: Tag) -> ReplyOutcome {
        if self.ctx.registry.remove(tag) {
            return ReplyOutcome::TimedOut;
        }

        match tokio::time::timeout(IN_FLIGHT_GRACE, self.outbound.recv()).await {
            Ok(Some(delivery)) if delivery.tag == tag => ReplyOutcome::Reply(delivery),
            _ => ReplyOutcome::TimedOut,
        }
    }

    async fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_buf.clear();
        self.ctx.settings.framing.encode(payload, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) {
        trace!(session = self.id, from = ?self.state, "Closing session");
        self.state = SessionState::Closing;

        let purged = self.ctx.registry.purge_all(self.id);
        if !purged.is_empty() {
            debug!(
                session = self.id,
                tags = ?purged,
                owned = self.pending.len(),
                "Purged in-flight requests"
            );
        }
        self.pending.clear();
        self.outbound.close();

        if let Err(e) = self.stream.shutdown().await {
            trace!(session = self.id, error = %e, "Socket shutdown failed");
        }
        self.state = SessionState::Closed;
    }
}

/// Next broadcast message, or never if this session has no feed.
async fn next_event(events: &mut Option<broadcast::Receiver<Arc<str>>>) -> Arc<str> {
    if let Some(rx) = events.as_mut() {
        loop {
            match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session fell behind on unsolicited messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    std::future::pending().await
}

/// Bookkeeping for a live connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

/// Table of live sessions using slab allocation.
///
/// Its capacity is the connection limit.
pub struct SessionTable {
    sessions: Slab<SessionInfo>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::with_capacity(max_sessions),
            max_sessions,
        }
    }

    /// Returns `None` if the table is at capacity.
    pub fn insert(&mut self, info: SessionInfo) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        Some(self.sessions.insert(info))
    }

    pub fn remove(&mut self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
