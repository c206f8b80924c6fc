use crate::events::{Event, EventSink};
use crate::fault::Fault;
use crate::rules::ErrorRuleSet;
use converge_schema::{ErrorStatus, HandlerErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::InProgress => write!(f, "in-progress"),
            OperationStatus::Success => write!(f, "success"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Step-completion state for one logical operation.
///
/// Completion flags only ever go from unset to set; nothing here clears one.
/// A logically new operation starts from a fresh context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackContext {
    #[serde(default)]
    completed: BTreeSet<String>,
    #[serde(default)]
    probes: BTreeMap<String, u32>,
    #[serde(default)]
    stabilized: BTreeSet<String>,
}

impl CallbackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self, flag: &str) -> bool {
        self.completed.contains(flag)
    }

    pub fn mark_done(&mut self, flag: &str) {
        self.completed.insert(flag.to_owned());
    }

    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    /// Failed evaluations recorded so far for `probe`.
    pub fn probe_attempts(&self, probe: &str) -> u32 {
        self.probes.get(probe).copied().unwrap_or(0)
    }

    /// Whether `probe` has already reported stable in this logical operation.
    pub fn is_stabilized(&self, probe: &str) -> bool {
        self.stabilized.contains(probe)
    }

    pub(crate) fn mark_stabilized(&mut self, probe: &str) {
        self.stabilized.insert(probe.to_owned());
    }

    /// Record one more failed evaluation and return the new count.
    pub(crate) fn record_probe_attempt(&mut self, probe: &str) -> u32 {
        let counter = self.probes.entry(probe.to_owned()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }
}

/// The record threaded through every step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent<M> {
    pub resource_model: M,
    pub callback_context: CallbackContext,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<HandlerErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds the scheduler should wait before re-invoking. Only meaningful
    /// while in progress.
    #[serde(default)]
    pub callback_delay_seconds: u32,
}

impl<M> ProgressEvent<M> {
    pub fn progress(resource_model: M, callback_context: CallbackContext) -> Self {
        Self {
            resource_model,
            callback_context,
            status: OperationStatus::InProgress,
            error_code: None,
            message: None,
            callback_delay_seconds: 0,
        }
    }

    /// In progress, but hand control back to the scheduler for `delay_seconds`.
    pub fn suspend(resource_model: M, callback_context: CallbackContext, delay_seconds: u32) -> Self {
        Self {
            callback_delay_seconds: delay_seconds,
            ..Self::progress(resource_model, callback_context)
        }
    }

    pub fn success(resource_model: M, callback_context: CallbackContext) -> Self {
        Self {
            status: OperationStatus::Success,
            ..Self::progress(resource_model, callback_context)
        }
    }

    pub fn failed(
        resource_model: M,
        callback_context: CallbackContext,
        code: HandlerErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: OperationStatus::Failed,
            error_code: Some(code),
            message: Some(message.into()),
            ..Self::progress(resource_model, callback_context)
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == OperationStatus::InProgress
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    /// Whether the next step may run: in progress and not suspended.
    pub fn can_continue(&self) -> bool {
        self.is_in_progress() && self.callback_delay_seconds == 0
    }

    /// Run `f` only if this record can continue; otherwise pass it through.
    #[must_use]
    pub fn then(self, f: impl FnOnce(Self) -> Self) -> Self {
        if self.can_continue() {
            f(self)
        } else {
            self
        }
    }

    /// Replace the model type, keeping status and context.
    pub fn map_model<N>(self, f: impl FnOnce(M) -> N) -> ProgressEvent<N> {
        ProgressEvent {
            resource_model: f(self.resource_model),
            callback_context: self.callback_context,
            status: self.status,
            error_code: self.error_code,
            message: self.message,
            callback_delay_seconds: self.callback_delay_seconds,
        }
    }

    /// What the scheduler needs to know about this record.
    pub fn outcome(&self) -> InvocationOutcome {
        InvocationOutcome {
            status: self.status,
            error_code: self.error_code,
            message: self.message.clone(),
            resume_delay_seconds: (self.is_in_progress() && self.callback_delay_seconds > 0)
                .then_some(self.callback_delay_seconds),
        }
    }
}

/// Scheduler-facing summary of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<HandlerErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_delay_seconds: Option<u32>,
}

/// Turn a classification outcome into the next record.
///
/// `None` means nothing classified the fault; it fails as an internal error so
/// that faults are never swallowed.
pub fn to_progress<M>(
    status: Option<ErrorStatus>,
    fault: &Fault,
    progress: ProgressEvent<M>,
) -> ProgressEvent<M> {
    let ProgressEvent {
        resource_model,
        callback_context,
        ..
    } = progress;
    match status {
        Some(ErrorStatus::Ignore) => ProgressEvent::progress(resource_model, callback_context),
        Some(ErrorStatus::FailWith(code)) => {
            ProgressEvent::failed(resource_model, callback_context, code, fault.to_string())
        }
        None => ProgressEvent::failed(
            resource_model,
            callback_context,
            HandlerErrorCode::InternalError,
            fault.to_string(),
        ),
    }
}

/// Classify `fault` against `rules` and translate the verdict.
pub fn handle_fault<M>(
    progress: ProgressEvent<M>,
    fault: &Fault,
    rules: &ErrorRuleSet,
    sink: &dyn EventSink,
) -> ProgressEvent<M> {
    let status = rules.find(fault);
    sink.emit(&Event::FaultClassified {
        fault: fault.to_string(),
        status: status.unwrap_or(crate::rules::UNCLASSIFIED),
    });
    to_progress(status, fault, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::rules::{ErrorRule, ErrorRuleSet};

    #[test]
    fn context_flags_are_monotonic() {
        let mut ctx = CallbackContext::new();
        assert!(!ctx.is_done("updated"));
        ctx.mark_done("updated");
        ctx.mark_done("updated");
        assert!(ctx.is_done("updated"));
        assert_eq!(ctx.completed().collect::<Vec<_>>(), vec!["updated"]);
    }

    #[test]
    fn context_roundtrips_through_json() {
        let mut ctx = CallbackContext::new();
        ctx.mark_done("rebooted");
        ctx.record_probe_attempt("available");
        ctx.record_probe_attempt("available");
        let json = serde_json::to_string(&ctx).unwrap();
        let back: CallbackContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
        assert_eq!(back.probe_attempts("available"), 2);
    }

    #[test]
    fn empty_json_object_is_a_fresh_context() {
        let ctx: CallbackContext = serde_json::from_str("{}").unwrap();
        assert_eq!(ctx, CallbackContext::new());
    }

    #[test]
    fn then_skips_terminal_and_suspended_records() {
        let failed: ProgressEvent<u32> = ProgressEvent::failed(
            0,
            CallbackContext::new(),
            HandlerErrorCode::NotFound,
            "gone",
        );
        let after = failed.then(|p| ProgressEvent::success(p.resource_model + 1, p.callback_context));
        assert!(after.is_failed());
        assert_eq!(after.resource_model, 0);

        let suspended = ProgressEvent::suspend(0u32, CallbackContext::new(), 30);
        let after = suspended.then(|p| ProgressEvent::success(p.resource_model + 1, p.callback_context));
        assert!(after.is_in_progress());
        assert_eq!(after.callback_delay_seconds, 30);

        let running = ProgressEvent::progress(0u32, CallbackContext::new());
        let after = running.then(|p| ProgressEvent::success(p.resource_model + 1, p.callback_context));
        assert!(after.is_success());
        assert_eq!(after.resource_model, 1);
    }

    #[test]
    fn ignore_is_a_soft_continue() {
        let p = ProgressEvent::progress("model", CallbackContext::new());
        let next = to_progress(Some(ErrorStatus::Ignore), &Fault::access_denied("no"), p);
        assert!(next.can_continue());
        assert_eq!(next.error_code, None);
        assert_eq!(next.message, None);
        assert_eq!(next.resource_model, "model");
    }

    #[test]
    fn fail_with_is_terminal_and_carries_message() {
        let p = ProgressEvent::progress("model", CallbackContext::new());
        let fault = Fault::service("ThrottlingException", "rate exceeded");
        let next = to_progress(
            Some(ErrorStatus::FailWith(HandlerErrorCode::Throttling)),
            &fault,
            p,
        );
        assert!(next.is_failed());
        assert_eq!(next.error_code, Some(HandlerErrorCode::Throttling));
        assert_eq!(next.message.as_deref(), Some("ThrottlingException: rate exceeded"));
    }

    #[test]
    fn unclassified_is_internal_error() {
        let p = ProgressEvent::progress((), CallbackContext::new());
        let next = to_progress(None, &Fault::client("???"), p);
        assert!(next.is_failed());
        assert_eq!(next.error_code, Some(HandlerErrorCode::InternalError));
    }

    #[test]
    fn handle_fault_preserves_context_and_emits_event() {
        let mut ctx = CallbackContext::new();
        ctx.mark_done("updated");
        let p = ProgressEvent::progress(1u8, ctx);
        let rules = ErrorRuleSet::new(vec![ErrorRule::by_code(
            "InvalidDBInstanceState",
            ErrorStatus::FailWith(HandlerErrorCode::ResourceConflict),
        )]);
        let sink = RecordingSink::new();
        let next = handle_fault(
            p,
            &Fault::service("InvalidDBInstanceState", "busy"),
            &rules,
            &sink,
        );
        assert_eq!(next.error_code, Some(HandlerErrorCode::ResourceConflict));
        assert!(next.callback_context.is_done("updated"));
        assert!(matches!(
            sink.events().as_slice(),
            [Event::FaultClassified { .. }]
        ));
    }

    #[test]
    fn outcome_reports_delay_only_while_in_progress() {
        let p = ProgressEvent::suspend((), CallbackContext::new(), 15);
        assert_eq!(p.outcome().resume_delay_seconds, Some(15));
        let p = ProgressEvent::progress((), CallbackContext::new());
        assert_eq!(p.outcome().resume_delay_seconds, None);
        let p = ProgressEvent::success((), CallbackContext::new());
        assert_eq!(p.outcome().status, OperationStatus::Success);
        assert_eq!(p.outcome().resume_delay_seconds, None);
    }

    #[test]
    fn map_model_keeps_status() {
        let p = ProgressEvent::failed(2u32, CallbackContext::new(), HandlerErrorCode::NotFound, "x");
        let q = p.map_model(|m| m.to_string());
        assert!(q.is_failed());
        assert_eq!(q.resource_model, "2");
    }
}
