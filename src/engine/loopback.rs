//! In-process engine.
//!
//! Answers each request through a responder function, echoing by default.
//! Handy for smoke-testing a deployment without the real engine attached.

use super::{Engine, SubmitError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct LoopbackEngine {
    responder: Responder,
    outbound: Mutex<VecDeque<String>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl LoopbackEngine {
    /// Every request comes straight back as its own response.
    pub fn echo() -> Self {
        Self::with_responder(|request| Some(request.to_string()))
    }

    /// Answer requests with whatever `responder` returns (`None` = no reply).
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            outbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response as if the engine produced it.
    pub(super) fn push(&self, response: String) {
        self.queue().push_back(response);
        self.ready.notify_one();
    }
}

impl Engine for LoopbackEngine {
    fn send(&self, request: &str) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        if let Some(response) = (self.responder)(request) {
            self.push(response);
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue();

        loop {
            if let Some(response) = queue.pop_front() {
                return Some(response);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queue = self
                .ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}
