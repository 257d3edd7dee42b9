//! Single-stream log watching.
//!
//! A watch opens a remote tail at end-of-stream, reports itself armed, then
//! (and only then) releases its trigger command. The trigger runs
//! asynchronously so it never blocks the tail loop. The watch ends on first
//! match, on deadline, or when the stream dies; the tail session is released
//! before `watch` returns on every path.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::transport::Transport;
use crate::types::{MatchResult, NodeId, WatchSpec};

/// Arm event reported by a gated watcher before any trigger may fire.
#[derive(Debug)]
pub(crate) struct ArmEvent {
    pub(crate) node: NodeId,
    /// False when the tail could not be opened; the watcher is done but the
    /// gate must still account for it.
    pub(crate) armed: bool,
}

/// Coordination handle for fan-out watching: each watcher reports an arm
/// event, and triggers wait for the correlator to flip `go` once every
/// sibling has reported.
#[derive(Debug, Clone)]
pub(crate) struct ArmGate {
    pub(crate) armed_tx: mpsc::UnboundedSender<ArmEvent>,
    pub(crate) go: watch::Receiver<bool>,
    /// Gated triggers report exec failures here so they surface in the
    /// correlation report instead of vanishing into a detached task.
    pub(crate) trigger_tx: mpsc::UnboundedSender<String>,
}

/// Tails one named remote stream, matching a pattern under a deadline.
#[derive(Debug)]
pub struct LogWatcher<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> Clone for LogWatcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> LogWatcher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Run a standalone watch. The trigger, if present, fires as soon as this
    /// watch is armed.
    pub async fn watch(&self, spec: &WatchSpec) -> MatchResult {
        self.watch_inner(spec, None).await
    }

    /// Run a watch whose trigger is gated on every sibling watcher arming.
    pub(crate) async fn watch_gated(&self, spec: &WatchSpec, gate: ArmGate) -> MatchResult {
        self.watch_inner(spec, Some(gate)).await
    }

    async fn watch_inner(&self, spec: &WatchSpec, gate: Option<ArmGate>) -> MatchResult {
        // The deadline covers the open phase as well: a slow or hung tail
        // open must not extend the watch past its timeout, and a correlated
        // fan-out stays bounded by the slowest spec.
        let deadline = Instant::now() + spec.timeout;
        let mut tail = match timeout_at(deadline, self.transport.tail(&spec.node, &spec.path)).await
        {
            Ok(Ok(tail)) => tail,
            Err(_) => {
                warn!(node = %spec.node, path = %spec.path, "tail open exceeded the watch deadline");
                if let Some(gate) = &gate {
                    let _ = gate.armed_tx.send(ArmEvent {
                        node: spec.node.clone(),
                        armed: false,
                    });
                }
                return MatchResult::timed_out(spec.node.clone());
            }
            Ok(Err(e)) => {
                warn!(node = %spec.node, path = %spec.path, error = %e, "failed to open tail");
                if let Some(gate) = &gate {
                    let _ = gate.armed_tx.send(ArmEvent {
                        node: spec.node.clone(),
                        armed: false,
                    });
                }
                return MatchResult::failed(spec.node.clone(), e.to_string());
            }
        };

        // Armed: from here on every new line is observed.
        debug!(node = %spec.node, path = %spec.path, "watch armed");
        if let Some(gate) = &gate {
            let _ = gate.armed_tx.send(ArmEvent {
                node: spec.node.clone(),
                armed: true,
            });
        }

        // The trigger must never run before arming; it is spawned only after
        // the tail is live, and a gated trigger additionally waits for the
        // go signal. It is fire-and-forget so it cannot stall the tail loop.
        if let Some(command) = spec.trigger.clone() {
            let transport = Arc::clone(&self.transport);
            let go = gate.as_ref().map(|g| g.go.clone());
            let trigger_tx = gate.as_ref().map(|g| g.trigger_tx.clone());
            tokio::spawn(async move {
                if let Some(mut go) = go {
                    while !*go.borrow() {
                        if go.changed().await.is_err() {
                            return;
                        }
                    }
                }
                info!(node = %command.node, command = %command.command, "executing trigger");
                if let Err(e) = transport.exec(&command.node, &command.command).await {
                    warn!(node = %command.node, error = %e, "trigger execution failed");
                    if let Some(tx) = trigger_tx {
                        let _ = tx.send(format!("trigger on {} failed: {e}", command.node));
                    }
                }
            });
        }

        let result = loop {
            let line = match timeout_at(deadline, tail.next_line()).await {
                Err(_) => {
                    debug!(node = %spec.node, path = %spec.path, "watch deadline elapsed without a match");
                    break MatchResult::timed_out(spec.node.clone());
                }
                Ok(None) => {
                    break MatchResult::failed(
                        spec.node.clone(),
                        "log stream closed before a match",
                    );
                }
                Ok(Some(Err(e))) => {
                    warn!(node = %spec.node, path = %spec.path, error = %e, "tail died mid-watch");
                    break MatchResult::failed(spec.node.clone(), e.to_string());
                }
                Ok(Some(Ok(line))) => line,
            };
            if let Some(caps) = spec.pattern.captures(&line) {
                info!(node = %spec.node, line = %line, "pattern matched");
                break MatchResult::matched(spec.node.clone(), &spec.pattern, &caps);
            }
        };

        // No tail session survives the watch that opened it.
        tail.close();
        result
    }
}
