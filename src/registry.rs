//! Correlation registry: which session is waiting for which tag.
//!
//! This is the one map shared between the dispatcher and every session.
//! All access goes through a single mutex and no lock is held across an
//! await point or any I/O.

use crate::tag::Tag;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Identifier of a connection session (its slot in the session table).
pub type SessionId = usize;

/// A tagged engine response on its way to the owning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: Tag,
    pub payload: String,
}

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingEntry {
    /// Session that submitted the request
    pub session: SessionId,
    /// The session's outbound queue
    pub deliver: mpsc::Sender<Delivery>,
    /// When the request was registered
    pub created_at: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("correlation tag {0} is already pending")]
    DuplicateTag(Tag),
}

/// Thread-safe map from correlation tag to pending request.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<Tag, PendingEntry>>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Tag, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `session` is waiting for the response tagged `tag`.
    pub fn register(
        &self,
        tag: Tag,
        session: SessionId,
        deliver: mpsc::Sender<Delivery>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&tag) {
            return Err(RegistryError::DuplicateTag(tag));
        }
        entries.insert(
            tag,
            PendingEntry {
                session,
                deliver,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Look up and remove the entry for `tag` in one step.
    ///
    /// Returns `None` for tags nobody is waiting on (unsolicited or
    /// orphaned responses).
    pub fn resolve_and_remove(&self, tag: Tag) -> Option<PendingEntry> {
        self.lock().remove(&tag)
    }

    /// Drop a single entry, e.g. after its request timed out.
    ///
    /// Returns false if the entry was already gone.
    pub fn remove(&self, tag: Tag) -> bool {
        self.lock().remove(&tag).is_some()
    }

    /// Remove every entry owned by `session`, returning the purged tags.
    pub fn purge_all(&self, session: SessionId) -> Vec<Tag> {
        let mut purged = Vec::new();
        self.lock().retain(|tag, entry| {
            if entry.session == session {
                purged.push(*tag);
                false
            } else {
                true
            }
        });
        purged.sort_unstable();
        purged
    }

    /// Remove entries registered longer than `max_age` ago.
    pub fn expire_older_than(&self, max_age: Duration) -> Vec<(Tag, SessionId)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.lock().retain(|tag, entry| {
            if now.duration_since(entry.created_at) > max_age {
                expired.push((*tag, entry.session));
                false
            } else {
                true
            }
        });
        expired
    }

    #[cfg(test)]
    pub fn contains(&self, tag: Tag) -> bool {
        self.lock().contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Background task removing entries whose session never cleaned them up.
pub async fn cleanup_task(
    registry: Arc<CorrelationRegistry>,
    max_age: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let expired = registry.expire_older_than(max_age);
        for (tag, session) in &expired {
            warn!(%tag, session, "Reaped stale correlation entry");
        }
        if !expired.is_empty() {
            debug!(
                count = expired.len(),
                remaining = registry.len(),
                "Cleaned up stale correlation entries"
            );
        }
    }
}
