//! Correlation tags for engine requests.
//!
//! Every request forwarded to the engine carries a tag minted here. The
//! engine echoes it back verbatim in the matching response, which is how
//! the dispatcher finds the session waiting for it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier embedded into a request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// Wrap a raw tag value read back from an engine payload.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The raw value written into the payload.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic tag allocator.
///
/// Tags are never reused, so a late response for an abandoned request can
/// never be mistaken for the reply to a newer one.
pub struct TagAllocator {
    next: AtomicU64,
}

impl TagAllocator {
    /// Create an allocator whose first tag is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Mint a fresh tag.
    pub fn next(&self) -> Tag {
        Tag(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `tag` was handed out by this allocator at some point.
    ///
    /// Used to tell orphaned responses (owner closed or timed out) apart
    /// from genuinely unsolicited engine messages.
    pub fn is_minted(&self, tag: Tag) -> bool {
        tag.0 != 0 && tag.0 < self.next.load(Ordering::Relaxed)
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_tags_are_monotonic() {
        let tags = TagAllocator::new();

        let t1 = tags.next();
        let t2 = tags.next();

        assert_eq!(t1.value(), 1);
        assert!(t2 > t1);
    }

    #[test]
    fn test_is_minted() {
        let tags = TagAllocator::new();
        assert!(!tags.is_minted(Tag::from_raw(1)));

        let t1 = tags.next();
        assert!(tags.is_minted(t1));
        assert!(!tags.is_minted(Tag::from_raw(0)));
        assert!(!tags.is_minted(Tag::from_raw(t1.value() + 1)));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let tags = Arc::new(TagAllocator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tags = Arc::clone(&tags);
                thread::spawn(move || (0..500).map(|_| tags.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for tag in handle.join().unwrap() {
                assert!(seen.insert(tag), "tag {tag} minted twice");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
