//! Engine running as a child process.
//!
//! Requests are written to the child's stdin and responses read from its
//! stdout, one JSON document per line. Two runtime tasks pump the pipes:
//! the writer drains a request channel, the reader fills a response queue
//! that `receive` waits on.

use super::{Engine, EngineError, SubmitError};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Output {
    lines: VecDeque<String>,
    eof: bool,
}

/// Lines read from the child, waiting for `receive`.
#[derive(Default)]
struct ResponseQueue {
    output: Mutex<Output>,
    ready: Condvar,
}

impl ResponseQueue {
    fn push(&self, line: String) {
        lock(&self.output).lines.push_back(line);
        self.ready.notify_one();
    }

    fn finish(&self) {
        lock(&self.output).eof = true;
        self.ready.notify_all();
    }
}

pub struct ProcessEngine {
    requests: Mutex<Option<mpsc::UnboundedSender<String>>>,
    responses: Arc<ResponseQueue>,
    child: Mutex<Option<Child>>,
    exited: AtomicBool,
}

impl ProcessEngine {
    /// Spawn `command` and wire up its stdin/stdout.
    ///
    /// Must be called from inside the tokio runtime, which hosts the pipe
    /// tasks.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Handle::try_current()?;

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::MissingPipe("stdout"))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let responses = Arc::new(ResponseQueue::default());

        runtime.spawn(writer_loop(stdin, request_rx));
        runtime.spawn(reader_loop(stdout, Arc::clone(&responses)));

        info!(pid = ?child.id(), "Engine process started");

        Ok(Self {
            requests: Mutex::new(Some(request_tx)),
            responses,
            child: Mutex::new(Some(child)),
            exited: AtomicBool::new(false),
        })
    }
}

/// Write each request as one line; stdin closes when the channel does.
async fn writer_loop(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(request) = rx.recv().await {
        let mut line = request.into_bytes();
        line.push(b'\n');

        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Failed to write to engine");
            break;
        }
    }
    trace!("Engine writer finished");
}

async fn reader_loop(stdout: ChildStdout, responses: Arc<ResponseQueue>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => responses.push(line),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from engine");
                break;
            }
        }
    }

    responses.finish();
    debug!("Engine output closed");
}

impl Engine for ProcessEngine {
    fn send(&self, request: &str) -> Result<(), SubmitError> {
        match lock(&self.requests).as_ref() {
            Some(tx) => tx
                .send(request.to_string())
                .map_err(|_| SubmitError::Rejected("engine input closed".to_string())),
            None => Err(SubmitError::Closed),
        }
    }

    fn receive(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut output = lock(&self.responses.output);

        loop {
            if let Some(line) = output.lines.pop_front() {
                return Some(line);
            }
            // An exited engine waits out the timeout instead of spinning
            if output.eof && !self.exited.swap(true, Ordering::SeqCst) {
                warn!("Engine process stopped producing output");
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            output = self
                .responses
                .ready
                .wait_timeout(output, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) {
        // Dropping the sender closes stdin once the writer drains
        lock(&self.requests).take();

        if let Some(mut child) = lock(&self.child).take() {
            match child.try_wait() {
                Ok(Some(status)) => info!(%status, "Engine process exited"),
                Ok(None) => match child.start_kill() {
                    Ok(()) => info!(pid = ?child.id(), "Engine process killed"),
                    Err(e) => trace!(error = %e, "Failed to kill engine process"),
                },
                Err(e) => trace!(error = %e, "Failed to query engine process"),
            }
            // Dropped children are reaped by the runtime
        }
    }
}
