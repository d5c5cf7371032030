//! Gateway counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    unsolicited: AtomicU64,
    orphaned: AtomicU64,
    timeouts: AtomicU64,
    submit_failures: AtomicU64,
    overflows: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub requests: u64,
    pub responses: u64,
    pub unsolicited: u64,
    pub orphaned: u64,
    pub timeouts: u64,
    pub submit_failures: u64,
    pub overflows: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GatewayStats {
    pub fn connection_accepted(&self) {
        bump(&self.connections_accepted);
    }

    pub fn connection_rejected(&self) {
        bump(&self.connections_rejected);
    }

    pub fn request_submitted(&self) {
        bump(&self.requests);
    }

    pub fn response_delivered(&self) {
        bump(&self.responses);
    }

    pub fn unsolicited(&self) {
        bump(&self.unsolicited);
    }

    pub fn orphaned(&self) {
        bump(&self.orphaned);
    }

    pub fn timed_out(&self) {
        bump(&self.timeouts);
    }

    pub fn submit_failed(&self) {
        bump(&self.submit_failures);
    }

    pub fn overflowed(&self) {
        bump(&self.overflows);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected),
            requests: load(&self.requests),
            responses: load(&self.responses),
            unsolicited: load(&self.unsolicited),
            orphaned: load(&self.orphaned),
            timeouts: load(&self.timeouts),
            submit_failures: load(&self.submit_failures),
            overflows: load(&self.overflows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = GatewayStats::default();
        stats.request_submitted();
        stats.request_submitted();
        stats.orphaned();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.orphaned, 1);
        assert_eq!(snapshot.responses, 0);
    }
}
