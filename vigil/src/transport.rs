//! Narrow interfaces through which the engine reaches the outside world.
//!
//! The engine is transport-agnostic: test orchestration supplies a status
//! probe for state waits plus a [`Transport`] (remote tail + remote exec) for
//! log watching. [`crate::ssh::SshTransport`] is the production
//! implementation; [`crate::mock::MockTransport`] is the scripted one used in
//! tests.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::EngineError;
use crate::types::NodeId;

/// Queries the current observable state of a named resource.
///
/// Must be safe to call repeatedly; the sampler invokes it once per attempt.
pub trait StatusProbe: Send + Sync {
    fn status(
        &self,
        resource_id: &str,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;
}

/// Any `Fn(String) -> Future<Result<String, _>>` closure works as a status
/// probe.
impl<F, Fut> StatusProbe for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, EngineError>> + Send,
{
    fn status(
        &self,
        resource_id: &str,
    ) -> impl Future<Output = Result<String, EngineError>> + Send {
        self(resource_id.to_string())
    }
}

/// Remote tail and remote exec, as provided by the orchestration layer.
pub trait Transport: Send + Sync + 'static {
    /// Open a live tail of `path` on `node`, starting at the current end of
    /// the stream (only lines appended after the call are yielded).
    fn tail(
        &self,
        node: &NodeId,
        path: &str,
    ) -> impl Future<Output = Result<TailHandle, EngineError>> + Send;

    /// Execute a command on a named remote node.
    fn exec(
        &self,
        node: &NodeId,
        command: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// A live tail session.
///
/// Lines arrive through a bounded channel fed by a transport-owned pump task.
/// Dropping (or closing) the handle aborts the pump and with it the
/// underlying session, so no tail outlives the watch that opened it.
#[derive(Debug)]
pub struct TailHandle {
    lines: mpsc::Receiver<Result<String, EngineError>>,
    pump: Option<JoinHandle<()>>,
}

impl TailHandle {
    /// Wrap a line channel whose sender side is driven by `pump`.
    pub fn new(lines: mpsc::Receiver<Result<String, EngineError>>, pump: JoinHandle<()>) -> Self {
        Self {
            lines,
            pump: Some(pump),
        }
    }

    /// Wrap a bare line channel (no pump task to tear down). Used by
    /// transports that push lines from elsewhere, such as the mock.
    pub fn from_channel(lines: mpsc::Receiver<Result<String, EngineError>>) -> Self {
        Self { lines, pump: None }
    }

    /// Next line from the stream. `None` means the stream closed and no
    /// further lines will arrive.
    pub async fn next_line(&mut self) -> Option<Result<String, EngineError>> {
        self.lines.recv().await
    }

    /// Release the underlying session. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.lines.close();
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channel depth for tail lines. Watches consume promptly; this only absorbs
/// bursts between poll points.
pub(crate) const TAIL_CHANNEL_DEPTH: usize = 64;
