//! The engine seam.
//!
//! The engine accepts one request at a time and emits responses on a single
//! receive stream. [`EngineAdapter`] splits one shared engine handle into:
//! - [`EngineSubmitter`]: cloned into every session, serializes `submit`
//! - [`EngineReceiver`]: owned by the dispatcher alone, the only caller of `poll`

mod loopback;
mod process;
#[cfg(test)]
mod recording;

pub use loopback::LoopbackEngine;
pub use process::ProcessEngine;
#[cfg(test)]
pub use recording::RecordingEngine;

use crate::config::{EngineConfig, EngineKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// A stateful request/response processor.
///
/// `send` is never called concurrently. `receive` is only ever called from
/// one thread at a time.
pub trait Engine: Send + Sync + 'static {
    /// Hand one serialized request to the engine.
    fn send(&self, request: &str) -> Result<(), SubmitError>;

    /// Wait up to `timeout` for the next response.
    fn receive(&self, timeout: Duration) -> Option<String>;

    /// Release the engine. Called once.
    fn close(&self);
}

/// The engine did not take a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("engine is shut down")]
    Closed,
    #[error("engine rejected the request: {0}")]
    Rejected(String),
}

/// The engine could not be started.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn engine '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("engine process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("engine process needs a running tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("engine kind 'process' requires a command")]
    MissingCommand,
}

/// Build the engine described by the configuration.
pub fn open(config: &EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
    match config.kind {
        EngineKind::Loopback => {
            info!("Using loopback engine");
            Ok(Arc::new(LoopbackEngine::echo()))
        }
        EngineKind::Process => {
            let command = config.command.as_deref().ok_or(EngineError::MissingCommand)?;
            info!(command, args = ?config.args, "Spawning engine process");
            Ok(Arc::new(ProcessEngine::spawn(command, &config.args)?))
        }
    }
}

struct Shared {
    engine: Arc<dyn Engine>,
    submit_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Shared {
    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.engine.close();
            info!("Engine released");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Owner of the engine's lifecycle.
pub struct EngineAdapter;

impl EngineAdapter {
    /// Split `engine` into its submit and receive halves.
    pub fn new(engine: Arc<dyn Engine>) -> (EngineSubmitter, EngineReceiver) {
        let shared = Arc::new(Shared {
            engine,
            submit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        (
            EngineSubmitter {
                shared: Arc::clone(&shared),
            },
            EngineReceiver { shared },
        )
    }
}

/// Submit side of the engine, shared by all sessions.
#[derive(Clone)]
pub struct EngineSubmitter {
    shared: Arc<Shared>,
}

impl EngineSubmitter {
    /// Hand a fully tagged request to the engine.
    ///
    /// The lock covers only the handoff, never the wait for a reply.
    pub fn submit(&self, payload: &str) -> Result<(), SubmitError> {
        if self.shared.is_closed() {
            return Err(SubmitError::Closed);
        }
        let _guard = self
            .shared
            .submit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.engine.send(payload)
    }

    /// Release the engine. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

/// Receive side of the engine. Deliberately not `Clone`.
pub struct EngineReceiver {
    shared: Arc<Shared>,
}

impl EngineReceiver {
    /// Wait up to `timeout` for the next engine response.
    ///
    /// The blocking receive runs on the blocking pool; this never waits
    /// much longer than `timeout`.
    pub async fn poll(&mut self, timeout: Duration) -> Option<String> {
        if self.shared.is_closed() {
            tokio::time::sleep(timeout).await;
            return None;
        }

        let engine = Arc::clone(&self.shared.engine);
        match tokio::task::spawn_blocking(move || engine.receive(timeout)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Engine poll task failed");
                None
            }
        }
    }

    /// Release the engine. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_submit_then_poll() {
        let engine = Arc::new(RecordingEngine::echo());
        let (submitter, mut receiver) = EngineAdapter::new(engine);

        submitter.submit(r#"{"n":1}"#).unwrap();
        let response = receiver.poll(Duration::from_secs(1)).await;
        assert_eq!(response.as_deref(), Some(r#"{"n":1}"#));
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let engine = Arc::new(RecordingEngine::silent());
        let (_submitter, mut receiver) = EngineAdapter::new(engine);

        let start = Instant::now();
        assert!(receiver.poll(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let engine = Arc::new(RecordingEngine::echo());
        let (submitter, receiver) = EngineAdapter::new(Arc::clone(&engine) as Arc<dyn Engine>);

        receiver.shutdown();
        submitter.shutdown();
        receiver.shutdown();

        assert_eq!(engine.close_count(), 1);
        assert_eq!(submitter.submit("{}"), Err(SubmitError::Closed));
    }

    #[tokio::test]
    async fn test_concurrent_submits_are_serialized() {
        let engine = Arc::new(RecordingEngine::echo());
        let (submitter, mut receiver) = EngineAdapter::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let submitter = submitter.clone();
                tokio::spawn(async move { submitter.submit(&format!("{{\"n\":{i}}}")) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut received = 0;
        while receiver.poll(Duration::from_millis(20)).await.is_some() {
            received += 1;
        }
        assert_eq!(received, 32);
        assert_eq!(engine.max_concurrent_sends(), 1);
    }

    #[test]
    fn test_open_process_without_command() {
        let config = EngineConfig {
            kind: EngineKind::Process,
            command: None,
            args: Vec::new(),
        };
        assert!(matches!(open(&config), Err(EngineError::MissingCommand)));
    }
}
