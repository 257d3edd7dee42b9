//! Core types for watches, matches and correlation.

use std::collections::HashMap;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Name of the capture group that identifies the acting node in an authority
/// pattern.
pub const ACTOR_GROUP: &str = "actor";

/// Unique identifier for a node taking part in a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A command executed on a remote node to cause the event under observation.
///
/// Executed exactly once per watch cycle, and never before the associated
/// watch has been armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCommand {
    /// Node the command runs on.
    pub node: NodeId,
    /// Shell command line passed to the remote exec transport.
    pub command: String,
}

impl TriggerCommand {
    pub fn new(node: NodeId, command: impl Into<String>) -> Self {
        Self {
            node,
            command: command.into(),
        }
    }
}

/// Specification of a single remote log watch.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    /// Node whose log stream is tailed.
    pub node: NodeId,
    /// Path of the log file on the node.
    pub path: String,
    /// Compiled line pattern; named capture groups become `MatchResult` keys.
    pub pattern: Regex,
    /// Per-watch deadline; the tail is abandoned once it elapses.
    pub timeout: Duration,
    /// Optional command fired (once, after arming) to cause the event.
    pub trigger: Option<TriggerCommand>,
}

impl WatchSpec {
    /// Build a watch spec, compiling and validating the pattern up front so a
    /// bad regex fails construction rather than a running watch.
    pub fn new(
        node: NodeId,
        path: impl Into<String>,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| EngineError::pattern(format!("{pattern:?}: {e}")))?;
        Ok(Self {
            node,
            path: path.into(),
            pattern,
            timeout,
            trigger: None,
        })
    }

    /// Attach a trigger command to this watch.
    pub fn with_trigger(mut self, trigger: TriggerCommand) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Named capture groups exposed by the pattern, in declaration order.
    pub fn named_groups(&self) -> Vec<&str> {
        self.pattern.capture_names().flatten().collect()
    }

    /// Whether the pattern exposes the `actor` capture group required of an
    /// authority watch.
    pub fn has_actor_group(&self) -> bool {
        self.named_groups().contains(&ACTOR_GROUP)
    }
}

/// Terminal outcome of a single watch cycle. Produced exactly once per
/// `WatchSpec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// Node the watch ran against.
    pub node: NodeId,
    /// Whether the pattern matched a line before the deadline.
    pub matched: bool,
    /// Captured named groups; keys come from the pattern. Empty unless
    /// `matched` is true.
    pub groups: HashMap<String, String>,
    /// Transport failure, if the tail died rather than merely timing out.
    /// `matched == false` with `error == None` is an ordinary timeout.
    pub error: Option<String>,
}

impl MatchResult {
    /// A successful match; `groups` is populated from every named capture
    /// group that participated in the match.
    pub fn matched(node: NodeId, pattern: &Regex, caps: &Captures<'_>) -> Self {
        let mut groups = HashMap::new();
        for name in pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                groups.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Self {
            node,
            matched: true,
            groups,
            error: None,
        }
    }

    /// Deadline elapsed without a match. A normal negative result.
    pub fn timed_out(node: NodeId) -> Self {
        Self {
            node,
            matched: false,
            groups: HashMap::new(),
            error: None,
        }
    }

    /// The tail transport failed before a match was seen.
    pub fn failed(node: NodeId, error: impl Into<String>) -> Self {
        Self {
            node,
            matched: false,
            groups: HashMap::new(),
            error: Some(error.into()),
        }
    }

    /// Whether the watch ended in a transport failure (as opposed to a match
    /// or a timeout). Callers may choose to retry only in this case.
    pub fn transport_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of correlating an authority stream against participant streams.
/// Derived and read-only; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationResult {
    /// Actor named by the authority stream; empty if the authority never
    /// matched.
    pub authority_actor: String,
    /// Node identities of every participant whose own log confirmed the
    /// event.
    pub confirmed_participants: Vec<String>,
    /// True when the authority named an actor and that actor independently
    /// confirmed.
    pub consistent: bool,
}

/// `CorrelationResult` plus the raw per-stream diagnostics it was derived
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub result: CorrelationResult,
    /// Terminal result of the authority watch.
    pub authority: MatchResult,
    /// Terminal results of every participant watch, in spec order.
    pub participants: Vec<MatchResult>,
    /// More than one participant confirmed. Permitted, recorded for
    /// diagnostics only.
    pub ambiguous: bool,
    /// Gated trigger commands that failed to execute. An all-timeout report
    /// with an entry here points at the trigger, not the logs.
    #[serde(default)]
    pub trigger_failures: Vec<String>,
}
