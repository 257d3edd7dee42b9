//! Error taxonomy for the verification engine.
//!
//! Only transport-level failures are errors here. A poll or watch that runs
//! out of deadline is a normal negative result and is carried in the result
//! structs (`Sampled`, `MatchResult`), never as an `EngineError`. Callers use
//! the distinction to decide between "operation didn't happen" and "retry the
//! whole verification".

use thiserror::Error;

/// Transport and configuration failures surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The status probe transport failed. Not a logical "not yet converged";
    /// an unreachable status endpoint aborts the wait.
    #[error("status probe failed for {resource}: {message}")]
    Probe { resource: String, message: String },

    /// A remote tail could not be opened or died mid-watch.
    #[error("tail failed on {node} ({path}): {message}")]
    Tail {
        node: String,
        path: String,
        message: String,
    },

    /// A trigger command could not be executed on the target node.
    #[error("remote exec failed on {node}: {message}")]
    Exec { node: String, message: String },

    /// A watch pattern failed to compile or lacks a required capture group.
    #[error("invalid watch pattern: {message}")]
    Pattern { message: String },

    /// Engine configuration could not be loaded or parsed.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    /// Whether this error came from the underlying transport (probe, tail or
    /// exec). Transport errors are the only class callers should consider
    /// retrying a whole verification for.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Probe { .. } | Self::Tail { .. } | Self::Exec { .. }
        )
    }

    pub(crate) fn tail(node: impl Into<String>, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tail {
            node: node.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn exec(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exec {
            node: node.into(),
            message: message.into(),
        }
    }

    pub(crate) fn pattern(message: impl Into<String>) -> Self {
        Self::Pattern {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
