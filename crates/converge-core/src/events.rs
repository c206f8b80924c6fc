//! Diagnostic events emitted by the pipeline, probes, and classifier.
//!
//! Components receive an `&dyn EventSink` explicitly instead of reaching for a
//! global logger. [`TracingSink`] forwards to `tracing`; [`RecordingSink`]
//! keeps events in memory for assertions.

use crate::progress::OperationStatus;
use converge_schema::ErrorStatus;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StepStarted {
        step: String,
    },
    StepFinished {
        step: String,
        status: OperationStatus,
        delay_seconds: u32,
    },
    /// An exactly-once step whose flag was already set.
    StepSkipped {
        step: String,
    },
    /// The pipeline stopped before `step` because the record can no longer continue.
    Halted {
        step: String,
        status: OperationStatus,
    },
    FaultClassified {
        fault: String,
        status: ErrorStatus,
    },
    ProbeEvaluated {
        probe: String,
        attempt: u32,
        max_attempts: u32,
        stable: bool,
    },
    ProbeExhausted {
        probe: String,
        max_attempts: u32,
    },
}

pub trait EventSink {
    fn emit(&self, event: &Event);
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::StepStarted { step } => debug!(step = %step, "step started"),
            Event::StepFinished {
                step,
                status,
                delay_seconds,
            } => debug!(step = %step, %status, delay_seconds, "step finished"),
            Event::StepSkipped { step } => debug!(step = %step, "step already completed, skipping"),
            Event::Halted { step, status } => {
                debug!(step = %step, %status, "pipeline halted");
            }
            Event::FaultClassified { fault, status } => {
                info!(fault = %fault, %status, "classified fault");
            }
            Event::ProbeEvaluated {
                probe,
                attempt,
                max_attempts,
                stable,
            } => debug!(probe = %probe, attempt, max_attempts, stable, "stabilization probe"),
            Event::ProbeExhausted {
                probe,
                max_attempts,
            } => warn!(probe = %probe, max_attempts, "stabilization attempts exhausted"),
        }
    }
}

/// Keeps every emitted event, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of steps that actually ran, in order.
    pub fn started_steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StepStarted { step } => Some(step),
                _ => None,
            })
            .collect()
    }

    pub fn skipped_steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StepSkipped { step } => Some(step),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}
