//! Loopback engine wrapper that records how it is driven.

use super::{Engine, LoopbackEngine, SubmitError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub struct RecordingEngine {
    inner: LoopbackEngine,
    submitted: Mutex<Vec<String>>,
    closes: AtomicUsize,
    sending: AtomicUsize,
    max_sending: AtomicUsize,
}

impl RecordingEngine {
    fn wrap(inner: LoopbackEngine) -> Self {
        Self {
            inner,
            submitted: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            sending: AtomicUsize::new(0),
            max_sending: AtomicUsize::new(0),
        }
    }

    pub fn echo() -> Self {
        Self::wrap(LoopbackEngine::echo())
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::wrap(LoopbackEngine::with_responder(responder))
    }

    /// Accepts requests and never answers them.
    pub fn silent() -> Self {
        Self::with_responder(|_| None)
    }

    /// Emit a response as if the engine produced it on its own.
    pub fn inject(&self, response: impl Into<String>) {
        self.inner.push(response.into());
    }

    /// Requests seen so far.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Highest number of `send` calls observed in flight at once.
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_sending.load(Ordering::SeqCst)
    }
}

impl Engine for RecordingEngine {
    fn send(&self, request: &str) -> Result<(), SubmitError> {
        let now = self.sending.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sending.fetch_max(now, Ordering::SeqCst);
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.to_string());
        // Widen the window for overlapping sends
        std::thread::yield_now();

        let result = self.inner.send(request);
        self.sending.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn receive(&self, timeout: Duration) -> Option<String> {
        self.inner.receive(timeout)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }
}
