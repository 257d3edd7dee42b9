//! Scripted in-memory transport for tests.
//!
//! No network sockets and no ssh: streams are scripted per `(node, path)` and
//! exec calls can be wired to emit lines on streams, which is how tests model
//! "the trigger causes the event". Every tail open and exec run is recorded
//! in a journal with its instant, so tests can assert ordering invariants
//! (notably: trigger never before arming).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use crate::errors::EngineError;
use crate::transport::{TAIL_CHANNEL_DEPTH, TailHandle, Transport};
use crate::types::NodeId;

type StreamKey = (NodeId, String);

/// Journal entry recorded by the mock.
#[derive(Debug, Clone)]
pub enum MockEvent {
    TailOpened {
        node: NodeId,
        path: String,
        at: Instant,
    },
    ExecRun {
        node: NodeId,
        command: String,
        at: Instant,
    },
}

#[derive(Debug, Clone, Default)]
struct StreamScript {
    /// Artificial delay before the tail is considered open (arming delay).
    open_delay: Duration,
    /// Fail the open outright with this message.
    fail_open: Option<String>,
    /// Lines emitted at offsets from the open instant, in order.
    timed_lines: Vec<(Duration, String)>,
    /// Simulate the node going away mid-watch: error after this offset.
    drop_after: Option<(Duration, String)>,
}

#[derive(Debug, Clone)]
struct ExecEffect {
    stream: StreamKey,
    delay: Duration,
    lines: Vec<String>,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<StreamKey, StreamScript>,
    exec_failures: HashMap<NodeId, String>,
    exec_effects: HashMap<NodeId, Vec<ExecEffect>>,
    open_tails: Vec<OpenTail>,
    journal: Vec<MockEvent>,
}

#[derive(Debug)]
struct OpenTail {
    key: StreamKey,
    tx: mpsc::Sender<Result<String, EngineError>>,
}

/// Builder-configured mock transport. Clones share state and journal.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// Deliver a line immediately to any open tail of `(node, path)`. Lines
    /// pushed while no tail is open are dropped, matching start-at-end
    /// semantics.
    pub async fn push_line(&self, node: &NodeId, path: &str, line: &str) {
        let key = (node.clone(), path.to_string());
        deliver(&self.state, &key, &[line.to_string()]).await;
    }

    /// Snapshot of the event journal.
    pub fn journal(&self) -> Vec<MockEvent> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).journal.clone()
    }

    /// Instant the first tail of `(node, path)` was opened, if any.
    pub fn tail_opened_at(&self, node: &NodeId, path: &str) -> Option<Instant> {
        self.journal().into_iter().find_map(|event| match event {
            MockEvent::TailOpened {
                node: n, path: p, at, ..
            } if &n == node && p == path => Some(at),
            _ => None,
        })
    }

    /// Instant the first exec on `node` ran, if any.
    pub fn exec_run_at(&self, node: &NodeId) -> Option<Instant> {
        self.journal().into_iter().find_map(|event| match event {
            MockEvent::ExecRun { node: n, at, .. } if &n == node => Some(at),
            _ => None,
        })
    }

    fn script_for(&self, key: &StreamKey) -> StreamScript {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scripts
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

/// Send `lines` to every currently open tail of `key`.
async fn deliver(state: &Arc<Mutex<MockState>>, key: &StreamKey, lines: &[String]) {
    let senders: Vec<_> = {
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .open_tails
            .iter()
            .filter(|t| &t.key == key)
            .map(|t| t.tx.clone())
            .collect()
    };
    for tx in senders {
        for line in lines {
            // A closed receiver just means the watch already ended.
            let _ = tx.send(Ok(line.clone())).await;
        }
    }
}

impl Transport for MockTransport {
    async fn tail(&self, node: &NodeId, path: &str) -> Result<TailHandle, EngineError> {
        let key = (node.clone(), path.to_string());
        let script = self.script_for(&key);

        if !script.open_delay.is_zero() {
            sleep(script.open_delay).await;
        }
        if let Some(message) = script.fail_open {
            return Err(EngineError::tail(node.as_str(), path, message));
        }

        let (tx, rx) = mpsc::channel(TAIL_CHANNEL_DEPTH);
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.open_tails.push(OpenTail {
                key: key.clone(),
                tx: tx.clone(),
            });
            guard.journal.push(MockEvent::TailOpened {
                node: node.clone(),
                path: path.to_string(),
                at: Instant::now(),
            });
        }

        if !script.timed_lines.is_empty() || script.drop_after.is_some() {
            let node = node.as_str().to_string();
            let path = path.to_string();
            tokio::spawn(async move {
                let mut offset = Duration::ZERO;
                for (at, line) in script.timed_lines {
                    sleep(at.saturating_sub(offset)).await;
                    offset = offset.max(at);
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
                if let Some((at, message)) = script.drop_after {
                    sleep(at.saturating_sub(offset)).await;
                    let _ = tx.send(Err(EngineError::tail(node, path, message))).await;
                }
            });
        }

        Ok(TailHandle::from_channel(rx))
    }

    async fn exec(&self, node: &NodeId, command: &str) -> Result<(), EngineError> {
        let (failure, effects) = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.journal.push(MockEvent::ExecRun {
                node: node.clone(),
                command: command.to_string(),
                at: Instant::now(),
            });
            (
                guard.exec_failures.get(node).cloned(),
                guard.exec_effects.get(node).cloned().unwrap_or_default(),
            )
        };

        if let Some(message) = failure {
            return Err(EngineError::exec(node.as_str(), message));
        }

        for effect in effects {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if !effect.delay.is_zero() {
                    sleep(effect.delay).await;
                }
                deliver(&state, &effect.stream, &effect.lines).await;
            });
        }
        Ok(())
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    state: MockState,
}

impl MockTransportBuilder {
    fn script_mut(&mut self, node: &NodeId, path: &str) -> &mut StreamScript {
        self.state
            .scripts
            .entry((node.clone(), path.to_string()))
            .or_default()
    }

    /// Emit `line` on the stream at `offset` after the tail opens.
    pub fn line_after(mut self, node: &NodeId, path: &str, offset: Duration, line: &str) -> Self {
        self.script_mut(node, path)
            .timed_lines
            .push((offset, line.to_string()));
        self
    }

    /// Delay the open of a tail (arming delay injection).
    pub fn delay_tail_open(mut self, node: &NodeId, path: &str, delay: Duration) -> Self {
        self.script_mut(node, path).open_delay = delay;
        self
    }

    /// Fail tail opens on this stream.
    pub fn fail_tail_open(mut self, node: &NodeId, path: &str, message: &str) -> Self {
        self.script_mut(node, path).fail_open = Some(message.to_string());
        self
    }

    /// Drop the stream with an error at `offset` after open (node restart).
    pub fn drop_stream_after(
        mut self,
        node: &NodeId,
        path: &str,
        offset: Duration,
        message: &str,
    ) -> Self {
        self.script_mut(node, path).drop_after = Some((offset, message.to_string()));
        self
    }

    /// When an exec runs on `exec_node`, emit `lines` on `(stream_node,
    /// stream_path)` after `delay`.
    pub fn lines_on_exec(
        mut self,
        exec_node: &NodeId,
        stream_node: &NodeId,
        stream_path: &str,
        delay: Duration,
        lines: &[&str],
    ) -> Self {
        self.state
            .exec_effects
            .entry(exec_node.clone())
            .or_default()
            .push(ExecEffect {
                stream: (stream_node.clone(), stream_path.to_string()),
                delay,
                lines: lines.iter().map(|l| l.to_string()).collect(),
            });
        self
    }

    /// Fail execs on this node.
    pub fn fail_exec(mut self, node: &NodeId, message: &str) -> Self {
        self.state
            .exec_failures
            .insert(node.clone(), message.to_string());
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_lines_arrive_in_order() {
        let mock = MockTransport::builder()
            .line_after(&node("a"), "/log", Duration::from_millis(10), "one")
            .line_after(&node("a"), "/log", Duration::from_millis(20), "two")
            .build();

        let mut tail = mock.tail(&node("a"), "/log").await.unwrap();
        assert_eq!(tail.next_line().await.unwrap().unwrap(), "one");
        assert_eq!(tail.next_line().await.unwrap().unwrap(), "two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_tail_open() {
        let mock = MockTransport::builder()
            .fail_tail_open(&node("a"), "/log", "connection refused")
            .build();

        let err = mock.tail(&node("a"), "/log").await.unwrap_err();
        assert!(matches!(err, EngineError::Tail { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_drop_surfaces_error() {
        let mock = MockTransport::builder()
            .drop_stream_after(&node("a"), "/log", Duration::from_millis(5), "node restarted")
            .build();

        let mut tail = mock.tail(&node("a"), "/log").await.unwrap();
        let err = tail.next_line().await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Tail { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_effect_reaches_open_tail_only() {
        let mock = MockTransport::builder()
            .lines_on_exec(
                &node("ctl"),
                &node("a"),
                "/log",
                Duration::ZERO,
                &["op executed"],
            )
            .build();

        // Exec before any tail is open: line is dropped.
        mock.exec(&node("ctl"), "start-op").await.unwrap();
        tokio::task::yield_now().await;

        let mut tail = mock.tail(&node("a"), "/log").await.unwrap();
        mock.exec(&node("ctl"), "start-op").await.unwrap();
        assert_eq!(tail.next_line().await.unwrap().unwrap(), "op executed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_records_open_and_exec_instants() {
        let mock = MockTransport::builder().build();

        let _tail = mock.tail(&node("a"), "/log").await.unwrap();
        sleep(Duration::from_millis(7)).await;
        mock.exec(&node("a"), "touch marker").await.unwrap();

        let opened = mock.tail_opened_at(&node("a"), "/log").unwrap();
        let ran = mock.exec_run_at(&node("a")).unwrap();
        assert!(ran >= opened + Duration::from_millis(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_exec() {
        let mock = MockTransport::builder()
            .fail_exec(&node("a"), "permission denied")
            .build();

        let err = mock.exec(&node("a"), "systemctl restart vdsmd").await.unwrap_err();
        assert!(matches!(err, EngineError::Exec { .. }));
    }
}
