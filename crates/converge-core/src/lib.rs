//! Resumable reconciliation engine for converge.
//!
//! A logical operation is a strictly ordered [`Pipeline`] of steps over a
//! [`ProgressEvent`]. Mutating steps are wrapped with [`exec_once`] so they run
//! at most once no matter how often the scheduler re-enters the pipeline;
//! asynchronous external transitions are waited out with cooperative
//! [`probe`]s; faults from external calls are classified against chained
//! [`ErrorRuleSet`]s into a closed set of outcomes. Diagnostics flow through
//! an explicitly passed [`EventSink`].

pub mod config;
pub mod events;
pub mod fault;
pub mod handler;
pub mod lifecycle;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod rules;

pub use config::HandlerConfig;
pub use events::{Event, EventSink, NullSink, RecordingSink, TracingSink};
pub use fault::Fault;
pub use handler::{invoke, ResourceHandler};
pub use lifecycle::validate_transition;
pub use pipeline::{exec_once, Pipeline};
pub use probe::{
    await_stable, probe, try_probe, BackoffStrategy, DelayPolicy, ExhaustionPolicy, Probe,
    Stabilization,
};
pub use progress::{
    handle_fault, to_progress, CallbackContext, InvocationOutcome, OperationStatus, ProgressEvent,
};
pub use rules::{
    classify, common_rule_set, load_overrides, ErrorRule, ErrorRuleSet, Matcher, UNCLASSIFIED,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("rule table error: {0}")]
    RuleTable(#[from] converge_schema::RuleTableError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
