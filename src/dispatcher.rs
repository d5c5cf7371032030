//! The dispatcher: sole reader of the engine's response stream.
//!
//! Pulls responses off the engine one at a time and routes each one to the
//! session whose tag it carries. Everything else goes to the unsolicited
//! sink. Nothing else in the process ever polls the engine.

use crate::engine::EngineReceiver;
use crate::protocol;
use crate::registry::{CorrelationRegistry, Delivery, SessionId};
use crate::stats::GatewayStats;
use crate::tag::{Tag, TagAllocator};
use clap::ValueEnum;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

/// What happens to engine messages no session is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnsolicitedPolicy {
    /// Write them to the log.
    #[default]
    Log,
    /// Forward them to every connected client.
    Broadcast,
    /// Discard them.
    Drop,
}

/// Destination for unsolicited engine messages.
pub struct UnsolicitedSink {
    policy: UnsolicitedPolicy,
    events: Option<broadcast::Sender<Arc<str>>>,
}

impl UnsolicitedSink {
    pub fn new(policy: UnsolicitedPolicy, capacity: usize) -> Self {
        let events = match policy {
            UnsolicitedPolicy::Broadcast => Some(broadcast::channel(capacity.max(1)).0),
            _ => None,
        };
        Self { policy, events }
    }

    /// A feed of broadcast messages, if the policy fans them out.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Arc<str>>> {
        self.events.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn publish(&self, payload: String) {
        match (self.policy, &self.events) {
            (UnsolicitedPolicy::Broadcast, Some(events)) => {
                // No subscribers is fine
                let receivers = events.send(payload.into()).unwrap_or(0);
                trace!(receivers, "Broadcast unsolicited message");
            }
            (UnsolicitedPolicy::Drop, _) => trace!("Dropped unsolicited message"),
            _ => info!(%payload, "Unsolicited engine message"),
        }
    }

    /// A response whose requester is gone. Never fanned out.
    pub fn orphan(&self, tag: Tag, payload: &str) {
        debug!(%tag, bytes = payload.len(), "Discarding response for abandoned request");
    }
}

/// Outcome of routing one engine response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Queued on the owning session.
    Delivered { session: SessionId },
    /// No live owner. `orphan` is set when the tag was once ours.
    Unsolicited { orphan: bool },
    /// Owner's queue was full; the response was dropped.
    Overflow { session: SessionId },
}

pub struct Dispatcher {
    receiver: EngineReceiver,
    registry: Arc<CorrelationRegistry>,
    tags: Arc<TagAllocator>,
    sink: Arc<UnsolicitedSink>,
    stats: Arc<GatewayStats>,
    tag_field: String,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: EngineReceiver,
        registry: Arc<CorrelationRegistry>,
        tags: Arc<TagAllocator>,
        sink: Arc<UnsolicitedSink>,
        stats: Arc<GatewayStats>,
        tag_field: String,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            receiver,
            registry,
            tags,
            sink,
            stats,
            tag_field,
            poll_interval,
            shutdown,
        }
    }

    /// Route responses until shutdown, then release the engine.
    ///
    /// The flag is checked between polls, so shutdown takes at most one
    /// poll interval and no response already taken off the engine is lost.
    pub async fn run(mut self) {
        info!(poll_interval = ?self.poll_interval, "Dispatcher started");

        while !*self.shutdown.borrow() {
            if let Some(payload) = self.receiver.poll(self.poll_interval).await {
                self.route(payload);
            }
        }

        self.receiver.shutdown();
        info!("Dispatcher stopped");
    }

    /// Send one engine response where it belongs.
    pub fn route(&self, payload: String) -> Routed {
        let Some(tag) = protocol::extract_tag(&payload, &self.tag_field) else {
            self.stats.unsolicited();
            self.sink.publish(payload);
            return Routed::Unsolicited { orphan: false };
        };

        let Some(entry) = self.registry.resolve_and_remove(tag) else {
            if self.tags.is_minted(tag) {
                self.stats.orphaned();
                self.sink.orphan(tag, &payload);
                return Routed::Unsolicited { orphan: true };
            }
            self.stats.unsolicited();
            self.sink.publish(payload);
            return Routed::Unsolicited { orphan: false };
        };

        let session = entry.session;
        match entry.deliver.try_send(Delivery { tag, payload }) {
            Ok(()) => {
                trace!(%tag, session, "Routed response");
                self.stats.response_delivered();
                Routed::Delivered { session }
            }
            Err(TrySendError::Full(_)) => {
                warn!(%tag, session, "Session queue full, dropping response");
                self.stats.overflowed();
                Routed::Overflow { session }
            }
            Err(TrySendError::Closed(delivery)) => {
                self.stats.orphaned();
                self.sink.orphan(tag, &delivery.payload);
                Routed::Unsolicited { orphan: true }
            }
        }
    }
}
