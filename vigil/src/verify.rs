//! Top-level operation verification.
//!
//! Triggers the operation under test, then runs log correlation concurrently
//! with polling an independent completion signal. Both halves must agree
//! before the run passes; this is the only place a final pass/fail verdict is
//! rendered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CompletionDefaults;
use crate::correlate::EventCorrelator;
use crate::errors::EngineError;
use crate::sampler::sample;
use crate::transport::Transport;
use crate::types::{CorrelationReport, WatchSpec};

/// Phases of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPhase {
    Idle,
    Triggering,
    Watching,
    Correlating,
    Completing,
    Pass,
    Fail,
}

impl std::fmt::Display for VerifyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Triggering => write!(f, "triggering"),
            Self::Watching => write!(f, "watching"),
            Self::Correlating => write!(f, "correlating"),
            Self::Completing => write!(f, "completing"),
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Final verdict of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Identifier of this run, carried through tracing output.
    pub run_id: Uuid,
    pub pass: bool,
    /// Human-readable account of which half failed, if any.
    pub detail: String,
    /// Correlation diagnostics; absent when the trigger itself failed.
    pub correlation: Option<CorrelationReport>,
    /// Whether the completion signal was observed within its deadline.
    pub completion_reached: bool,
    pub elapsed: Duration,
}

/// Orchestrates trigger, correlation and completion polling.
#[derive(Debug)]
pub struct OperationVerifier<T: Transport> {
    correlator: EventCorrelator<T>,
    completion: CompletionDefaults,
}

impl<T: Transport> OperationVerifier<T> {
    pub fn new(transport: Arc<T>, completion: CompletionDefaults) -> Self {
        Self {
            correlator: EventCorrelator::new(transport),
            completion,
        }
    }

    /// Run one verification cycle.
    ///
    /// `trigger` kicks off the operation under test; callers that need the
    /// race-free path pass a no-op here and attach the `TriggerCommand` to
    /// the authority spec instead, where it is gated on arming. `completion`
    /// is polled until it reports true or its deadline elapses.
    ///
    /// Logical failures (no match, inconsistent correlation, completion
    /// timeout) come back as a failing `Verdict`. Transport failures of the
    /// completion probe come back as `Err`, so callers can retry the whole
    /// verification rather than misread an unreachable endpoint as
    /// "operation didn't happen".
    pub async fn verify<Tr, TrFut, C, CFut>(
        &self,
        trigger: Tr,
        authority: WatchSpec,
        participants: Vec<WatchSpec>,
        completion: C,
    ) -> Result<Verdict, EngineError>
    where
        Tr: FnOnce() -> TrFut,
        TrFut: Future<Output = Result<(), EngineError>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = Result<bool, EngineError>>,
    {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut phase = VerifyPhase::Idle;

        phase = advance(run_id, phase, VerifyPhase::Triggering);
        if let Err(e) = trigger().await {
            advance(run_id, phase, VerifyPhase::Fail);
            return Ok(Verdict {
                run_id,
                pass: false,
                detail: format!("trigger failed: {e}"),
                correlation: None,
                completion_reached: false,
                elapsed: started.elapsed(),
            });
        }

        phase = advance(run_id, phase, VerifyPhase::Watching);
        let correlate_fut = self.correlator.correlate(authority, participants);
        let mut completion = completion;
        let completion_fut = sample(
            move || {
                let fut = completion();
                async move {
                    let done = fut.await?;
                    Ok((done, done))
                }
            },
            self.completion.timeout,
            self.completion.interval,
        );

        // Correlation and completion polling run concurrently from here, so
        // both transitions are traced before the join starts.
        phase = advance(run_id, phase, VerifyPhase::Correlating);
        phase = advance(run_id, phase, VerifyPhase::Completing);

        // Logical AND, not a race: the operation is not verified until both
        // the log-level confirmation and the completion signal agree.
        let (report, completion) = tokio::join!(correlate_fut, completion_fut);
        let report = report?;
        let completion = completion?;

        let completion_reached = completion.converged;
        let pass = report.result.consistent && completion_reached;
        let detail = if pass {
            format!(
                "operation verified: actor {:?} confirmed, completion observed",
                report.result.authority_actor
            )
        } else {
            failure_detail(&report, completion_reached, self.completion.timeout)
        };

        let terminal = if pass { VerifyPhase::Pass } else { VerifyPhase::Fail };
        advance(run_id, phase, terminal);
        if pass {
            info!(%run_id, detail = %detail, "verification passed");
        } else {
            warn!(%run_id, detail = %detail, "verification failed");
        }

        Ok(Verdict {
            run_id,
            pass,
            detail,
            correlation: Some(report),
            completion_reached,
            elapsed: started.elapsed(),
        })
    }
}

fn advance(run_id: Uuid, from: VerifyPhase, to: VerifyPhase) -> VerifyPhase {
    info!(%run_id, %from, %to, "verify phase transition");
    to
}

/// Name the failing half (or halves) with enough context to diagnose.
fn failure_detail(
    report: &CorrelationReport,
    completion_reached: bool,
    completion_timeout: Duration,
) -> String {
    let mut parts = Vec::new();

    if !report.result.consistent {
        if let Some(error) = &report.authority.error {
            parts.push(format!("authority watch failed: {error}"));
        } else if !report.authority.matched {
            parts.push("authority log never matched (no actor identified)".to_string());
        } else {
            parts.push(format!(
                "authority claimed {:?} but confirmed participants were {:?}",
                report.result.authority_actor, report.result.confirmed_participants
            ));
        }
    }
    if !completion_reached {
        parts.push(format!(
            "completion signal not observed within {}",
            humantime::format_duration(completion_timeout)
        ));
    }

    parts.join("; ")
}
