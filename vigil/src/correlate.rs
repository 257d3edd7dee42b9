//! Cross-node event correlation.
//!
//! Fans out one authority watch plus N participant watches concurrently,
//! releases triggers only once every watcher has reported in, joins them all,
//! and checks that the actor the authority names is among the participants
//! that independently confirmed the event.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::transport::Transport;
use crate::types::{ACTOR_GROUP, CorrelationReport, CorrelationResult, MatchResult, WatchSpec};
use crate::watcher::{ArmGate, LogWatcher};

/// Correlates an authority stream against participant streams.
#[derive(Debug)]
pub struct EventCorrelator<T: Transport> {
    watcher: LogWatcher<T>,
}

impl<T: Transport> Clone for EventCorrelator<T> {
    fn clone(&self) -> Self {
        Self {
            watcher: self.watcher.clone(),
        }
    }
}

impl<T: Transport> EventCorrelator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            watcher: LogWatcher::new(transport),
        }
    }

    /// Run all watches and correlate their terminal results.
    ///
    /// Every watcher runs to its own completion or timeout; a failing
    /// authority does not cancel the participants, so full participant
    /// diagnostics are always collected. Total blocking time is bounded by
    /// the slowest single watch, not the sum.
    pub async fn correlate(
        &self,
        authority: WatchSpec,
        participants: Vec<WatchSpec>,
    ) -> Result<CorrelationReport, EngineError> {
        if !authority.has_actor_group() {
            return Err(EngineError::pattern(format!(
                "authority pattern {:?} lacks a `{ACTOR_GROUP}` named capture group",
                authority.pattern.as_str()
            )));
        }

        let total = participants.len() + 1;
        info!(
            authority = %authority.node,
            participants = participants.len(),
            "starting correlated watch"
        );

        let (armed_tx, mut armed_rx) = mpsc::unbounded_channel();
        let (go_tx, go_rx) = watch::channel(false);
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let gate = ArmGate {
            armed_tx,
            go: go_rx,
            trigger_tx,
        };

        let authority_task = {
            let watcher = self.watcher.clone();
            let gate = gate.clone();
            let spec = authority.clone();
            tokio::spawn(async move { watcher.watch_gated(&spec, gate).await })
        };
        let participant_tasks: Vec<_> = participants
            .iter()
            .map(|spec| {
                let watcher = self.watcher.clone();
                let gate = gate.clone();
                let spec = spec.clone();
                tokio::spawn(async move { watcher.watch_gated(&spec, gate).await })
            })
            .collect();
        drop(gate);

        // Release triggers only once every watcher has reported in, armed or
        // aborted. An aborted watcher still counts; its failure shows up in
        // its MatchResult.
        for _ in 0..total {
            match armed_rx.recv().await {
                Some(event) => {
                    debug!(node = %event.node, armed = event.armed, "watcher reported in");
                }
                None => break,
            }
        }
        let _ = go_tx.send(true);
        debug!("all watchers reported in; triggers released");

        let authority_result = join_watch(authority_task, &authority).await;
        let mut participant_results = Vec::with_capacity(participants.len());
        for (task, spec) in participant_tasks.into_iter().zip(participants.iter()) {
            participant_results.push(join_watch(task, spec).await);
        }

        // All watchers have joined. Drain any gated-trigger failures that
        // arrived in the meantime into the report diagnostics.
        let mut trigger_failures = Vec::new();
        while let Ok(failure) = trigger_rx.try_recv() {
            trigger_failures.push(failure);
        }

        Ok(build_report(
            authority_result,
            participant_results,
            trigger_failures,
        ))
    }
}

async fn join_watch(
    task: tokio::task::JoinHandle<MatchResult>,
    spec: &WatchSpec,
) -> MatchResult {
    match task.await {
        Ok(result) => result,
        Err(e) => MatchResult::failed(spec.node.clone(), format!("watcher task failed: {e}")),
    }
}

fn build_report(
    authority: MatchResult,
    participants: Vec<MatchResult>,
    trigger_failures: Vec<String>,
) -> CorrelationReport {
    let authority_actor = authority
        .groups
        .get(ACTOR_GROUP)
        .cloned()
        .unwrap_or_default();
    let confirmed_participants: Vec<String> = participants
        .iter()
        .filter(|r| r.matched)
        .map(|r| r.node.as_str().to_string())
        .collect();
    let consistent = !authority_actor.is_empty()
        && confirmed_participants
            .iter()
            .any(|n| n == &authority_actor);
    let ambiguous = confirmed_participants.len() > 1;

    if consistent {
        info!(
            actor = %authority_actor,
            confirmed = ?confirmed_participants,
            "correlation consistent"
        );
    } else {
        warn!(
            actor = %authority_actor,
            confirmed = ?confirmed_participants,
            "correlation inconsistent"
        );
    }
    if ambiguous {
        // Multiple simultaneous confirmations are permitted, but worth a
        // trace for diagnosis.
        warn!(
            confirmed = ?confirmed_participants,
            "more than one participant confirmed the event"
        );
    }
    for failure in &trigger_failures {
        warn!(failure = %failure, "trigger failed during the correlated watch");
    }

    CorrelationReport {
        result: CorrelationResult {
            authority_actor,
            confirmed_participants,
            consistent,
        },
        authority,
        participants,
        ambiguous,
        trigger_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::mock::MockTransport;
    use crate::types::{NodeId, TriggerCommand};

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn authority_spec(timeout: Duration) -> WatchSpec {
        WatchSpec::new(
            node("engine"),
            "/var/log/engine.log",
            r"^op started on (?P<actor>[\w-]+)$",
            timeout,
        )
        .unwrap()
    }

    fn participant_spec(id: &str, timeout: Duration) -> WatchSpec {
        WatchSpec::new(node(id), "/var/log/vdsm.log", r"^op executed$", timeout).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_authority_pattern_must_name_an_actor() {
        let correlator = EventCorrelator::new(Arc::new(MockTransport::builder().build()));
        let bad_authority = WatchSpec::new(
            node("engine"),
            "/var/log/engine.log",
            r"^op started$",
            Duration::from_secs(5),
        )
        .unwrap();

        let err = correlator
            .correlate(bad_authority, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pattern { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistent_when_named_actor_confirms() {
        let mock = MockTransport::builder()
            .line_after(
                &node("engine"),
                "/var/log/engine.log",
                Duration::from_millis(10),
                "op started on node-7",
            )
            .line_after(
                &node("node-7"),
                "/var/log/vdsm.log",
                Duration::from_millis(15),
                "op executed",
            )
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(10)),
                vec![
                    participant_spec("node-7", Duration::from_secs(10)),
                    participant_spec("node-8", Duration::from_millis(100)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.result.authority_actor, "node-7");
        assert_eq!(report.result.confirmed_participants, vec!["node-7"]);
        assert!(report.result.consistent);
        assert!(!report.ambiguous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistent_when_no_participant_confirms() {
        let mock = MockTransport::builder()
            .line_after(
                &node("engine"),
                "/var/log/engine.log",
                Duration::from_millis(10),
                "op started on node-7",
            )
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(5)),
                vec![
                    participant_spec("node-7", Duration::from_millis(200)),
                    participant_spec("node-8", Duration::from_millis(200)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.result.authority_actor, "node-7");
        assert!(report.result.confirmed_participants.is_empty());
        assert!(!report.result.consistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistent_when_wrong_node_confirms() {
        let mock = MockTransport::builder()
            .line_after(
                &node("engine"),
                "/var/log/engine.log",
                Duration::from_millis(10),
                "op started on node-7",
            )
            .line_after(
                &node("node-8"),
                "/var/log/vdsm.log",
                Duration::from_millis(15),
                "op executed",
            )
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(5)),
                vec![
                    participant_spec("node-7", Duration::from_millis(200)),
                    participant_spec("node-8", Duration::from_millis(200)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.result.confirmed_participants, vec!["node-8"]);
        assert!(!report.result.consistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_confirmations_permitted_but_flagged() {
        let mock = MockTransport::builder()
            .line_after(
                &node("engine"),
                "/var/log/engine.log",
                Duration::from_millis(10),
                "op started on node-7",
            )
            .line_after(
                &node("node-7"),
                "/var/log/vdsm.log",
                Duration::from_millis(15),
                "op executed",
            )
            .line_after(
                &node("node-8"),
                "/var/log/vdsm.log",
                Duration::from_millis(15),
                "op executed",
            )
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(5)),
                vec![
                    participant_spec("node-7", Duration::from_secs(5)),
                    participant_spec("node-8", Duration::from_secs(5)),
                ],
            )
            .await
            .unwrap();

        assert!(report.result.consistent);
        assert!(report.ambiguous);
        assert_eq!(report.result.confirmed_participants.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_bounded_by_slowest_watch() {
        let correlator = EventCorrelator::new(Arc::new(MockTransport::builder().build()));
        let start = tokio::time::Instant::now();

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(4)),
                vec![
                    participant_spec("node-7", Duration::from_secs(9)),
                    participant_spec("node-8", Duration::from_secs(2)),
                ],
            )
            .await
            .unwrap();

        assert!(!report.result.consistent);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9));
        assert!(elapsed < Duration::from_secs(10), "waited longer than max(timeouts): {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tail_open_does_not_stall_correlation() {
        let mock = MockTransport::builder()
            .delay_tail_open(&node("node-7"), "/var/log/vdsm.log", Duration::from_secs(60))
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));
        let start = tokio::time::Instant::now();

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(2)),
                vec![participant_spec("node-7", Duration::from_secs(3))],
            )
            .await
            .unwrap();

        assert!(!report.result.consistent);
        // The stuck open counts against node-7's own deadline, so the whole
        // correlation still concludes within max(timeouts).
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4), "correlate blocked {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_exec_failure_surfaces_in_report() {
        let mock = MockTransport::builder()
            .fail_exec(&node("engine"), "ssh exited 255")
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(2)).with_trigger(TriggerCommand::new(
                    node("engine"),
                    "engine-trigger op",
                )),
                vec![participant_spec("node-7", Duration::from_secs(2))],
            )
            .await
            .unwrap();

        assert!(!report.result.consistent);
        assert_eq!(report.trigger_failures.len(), 1);
        assert!(report.trigger_failures[0].contains("engine"));
        assert!(report.trigger_failures[0].contains("ssh exited 255"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_tail_failure_collected_as_diagnostics() {
        let mock = MockTransport::builder()
            .line_after(
                &node("engine"),
                "/var/log/engine.log",
                Duration::from_millis(10),
                "op started on node-7",
            )
            .fail_tail_open(&node("node-7"), "/var/log/vdsm.log", "connection refused")
            .build();
        let correlator = EventCorrelator::new(Arc::new(mock));

        let report = correlator
            .correlate(
                authority_spec(Duration::from_secs(5)),
                vec![participant_spec("node-7", Duration::from_secs(5))],
            )
            .await
            .unwrap();

        assert!(!report.result.consistent);
        assert!(report.participants[0].transport_failed());
        // Authority diagnostics survive alongside the failed participant.
        assert_eq!(report.result.authority_actor, "node-7");
    }

    #[test]
    fn test_build_report_groups_lookup_is_typed_by_pattern() {
        let mut groups = HashMap::new();
        groups.insert(ACTOR_GROUP.to_string(), "node-7".to_string());
        let authority = MatchResult {
            node: node("engine"),
            matched: true,
            groups,
            error: None,
        };
        let confirmed = MatchResult {
            node: node("node-7"),
            matched: true,
            groups: HashMap::new(),
            error: None,
        };

        let report = build_report(authority, vec![confirmed], Vec::new());
        assert!(report.result.consistent);
        assert!(report.trigger_failures.is_empty());
    }
}
