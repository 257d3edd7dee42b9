//! vigil — asynchronous state-convergence and cross-node event-correlation.
//!
//! Verifies that a distributed background operation, triggered on a central
//! controller, was actually executed by the correct worker node: N+1 remote
//! log streams are tailed concurrently under bounded deadlines, the stream of
//! record names an actor, and that actor's own log must independently confirm
//! the event. The same polling primitive backs every
//! "wait for resource to reach state X" operation in the harness.
//!
//! Layering, leaves first:
//!
//! - [`sampler`]: bounded poll-until-condition-or-timeout, plus state waits.
//! - [`watcher`]: tail one remote stream, match a pattern, optionally fire a
//!   trigger once armed.
//! - [`correlate`]: fan out watchers, join them all, correlate authority
//!   against participants.
//! - [`verify`]: trigger the operation, run correlation and completion
//!   polling concurrently, render the only pass/fail verdict.
//!
//! The engine reaches the outside world through the narrow [`transport`]
//! interfaces; [`ssh`] is the production implementation and [`mock`] the
//! scripted one for tests. All entities are created fresh per verification
//! run; nothing persists across runs.

pub mod config;
pub mod correlate;
pub mod errors;
pub mod mock;
pub mod sampler;
pub mod ssh;
pub mod testing;
pub mod transport;
pub mod types;
pub mod verify;
pub mod watcher;

pub use config::{CompletionDefaults, EngineConfig, SshOptions, WatchDefaults};
pub use correlate::EventCorrelator;
pub use errors::EngineError;
pub use sampler::{Sampled, StateWait, sample, wait_for_state};
pub use ssh::SshTransport;
pub use transport::{StatusProbe, TailHandle, Transport};
pub use types::{
    ACTOR_GROUP, CorrelationReport, CorrelationResult, MatchResult, NodeId, TriggerCommand,
    WatchSpec,
};
pub use verify::{OperationVerifier, Verdict, VerifyPhase};
pub use watcher::LogWatcher;
