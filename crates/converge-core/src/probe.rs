//! Cooperative stabilization polling.
//!
//! A probe never blocks. Each call evaluates the readiness predicate at most
//! once; while the resource is not ready the caller suspends and the scheduler
//! re-invokes later. Failed evaluations are counted per probe name in the
//! [`CallbackContext`], so the bound holds across the whole logical operation.

use crate::config::HandlerConfig;
use crate::events::{Event, EventSink, NullSink};
use crate::fault::Fault;
use crate::progress::{handle_fault, CallbackContext, ProgressEvent};
use crate::rules::ErrorRuleSet;
use converge_schema::HandlerErrorCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stabilization {
    Stable,
    /// Not ready yet; `attempt` failed evaluations so far, budget remaining.
    Pending { attempt: u32 },
    /// The attempt budget is spent. Permanent for this logical operation.
    Exhausted,
}

impl Stabilization {
    pub fn is_stable(self) -> bool {
        self == Stabilization::Stable
    }
}

/// Evaluate `ready` once against the counter stored under `name`.
///
/// Once `max_attempts` failed evaluations are recorded the predicate is no
/// longer called and the probe reports [`Stabilization::Exhausted`]. A probe
/// that reported stable stays stable without further evaluations.
pub fn probe(
    ctx: &mut CallbackContext,
    name: &str,
    max_attempts: u32,
    sink: &dyn EventSink,
    ready: impl FnOnce() -> bool,
) -> Stabilization {
    match try_probe::<std::convert::Infallible>(ctx, name, max_attempts, sink, || Ok(ready())) {
        Ok(state) => state,
        Err(never) => match never {},
    }
}

/// Like [`probe`], for predicates that query something fallible.
///
/// An `Err` from the predicate is returned as-is and is not counted as an
/// attempt.
pub fn try_probe<E>(
    ctx: &mut CallbackContext,
    name: &str,
    max_attempts: u32,
    sink: &dyn EventSink,
    ready: impl FnOnce() -> Result<bool, E>,
) -> Result<Stabilization, E> {
    if ctx.is_stabilized(name) {
        return Ok(Stabilization::Stable);
    }
    if ctx.probe_attempts(name) >= max_attempts {
        sink.emit(&Event::ProbeExhausted {
            probe: name.to_owned(),
            max_attempts,
        });
        return Ok(Stabilization::Exhausted);
    }

    let stable = ready()?;
    if stable {
        sink.emit(&Event::ProbeEvaluated {
            probe: name.to_owned(),
            attempt: ctx.probe_attempts(name) + 1,
            max_attempts,
            stable,
        });
        ctx.mark_stabilized(name);
        return Ok(Stabilization::Stable);
    }

    let attempt = ctx.record_probe_attempt(name);
    sink.emit(&Event::ProbeEvaluated {
        probe: name.to_owned(),
        attempt,
        max_attempts,
        stable,
    });
    if attempt >= max_attempts {
        sink.emit(&Event::ProbeExhausted {
            probe: name.to_owned(),
            max_attempts,
        });
        Ok(Stabilization::Exhausted)
    } else {
        Ok(Stabilization::Pending { attempt })
    }
}

/// `true` once the resource is stable; `false` while pending and forever after
/// exhaustion.
pub fn await_stable(
    ctx: &mut CallbackContext,
    name: &str,
    max_attempts: u32,
    ready: impl FnOnce() -> bool,
) -> bool {
    probe(ctx, name, max_attempts, &NullSink, ready).is_stable()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
}

/// How long the scheduler should wait before the next probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayPolicy {
    pub strategy: BackoffStrategy,
    pub base_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seconds: Option<u32>,
}

impl DelayPolicy {
    pub fn constant(seconds: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Constant,
            base_seconds: seconds,
            max_seconds: None,
        }
    }

    pub fn exponential(base_seconds: u32, max_seconds: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_seconds,
            max_seconds: Some(max_seconds),
        }
    }

    /// Delay after the `attempt`-th failed evaluation (1-based).
    ///
    /// Never zero: a zero delay would not suspend the pipeline.
    pub fn delay_seconds(&self, attempt: u32) -> u32 {
        let n = attempt.saturating_sub(1);
        let raw = match self.strategy {
            BackoffStrategy::Constant => self.base_seconds,
            BackoffStrategy::Linear => self.base_seconds.saturating_mul(n.saturating_add(1)),
            BackoffStrategy::Exponential => self
                .base_seconds
                .saturating_mul(2u32.saturating_pow(n)),
        };
        let capped = match self.max_seconds {
            Some(max) => raw.min(max),
            None => raw,
        };
        capped.max(1)
    }
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::constant(30)
    }
}

/// What a probe step does once its attempt budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    Fail(HandlerErrorCode),
    /// Best effort: carry on as if stable.
    Accept,
}

/// A named stabilization wait, packaged as a pipeline step.
#[derive(Debug, Clone)]
pub struct Probe {
    name: String,
    enabled: bool,
    max_attempts: u32,
    delay: DelayPolicy,
    on_exhausted: ExhaustionPolicy,
}

impl Probe {
    pub fn new(name: &str, max_attempts: u32, delay: DelayPolicy) -> Self {
        Self {
            name: name.to_owned(),
            enabled: true,
            max_attempts,
            delay,
            on_exhausted: ExhaustionPolicy::Fail(HandlerErrorCode::NotStabilized),
        }
    }

    pub fn from_config(name: &str, config: &HandlerConfig) -> Self {
        Self {
            enabled: config.probing_enabled,
            ..Self::new(name, config.stabilization_attempts, config.delay)
        }
    }

    #[must_use]
    pub fn on_exhausted(mut self, policy: ExhaustionPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One probe as a pipeline step.
    ///
    /// Stable → the record passes through. Pending → suspended with the
    /// policy's delay. Exhausted → per [`ExhaustionPolicy`]. A fault raised by
    /// the predicate is classified against `rules`.
    pub fn wait<M>(
        &self,
        mut progress: ProgressEvent<M>,
        rules: &ErrorRuleSet,
        sink: &dyn EventSink,
        ready: impl FnOnce(&M) -> Result<bool, Fault>,
    ) -> ProgressEvent<M> {
        if !self.enabled {
            return progress;
        }
        let model = &progress.resource_model;
        let verdict = try_probe(
            &mut progress.callback_context,
            &self.name,
            self.max_attempts,
            sink,
            || ready(model),
        );
        match verdict {
            Ok(Stabilization::Stable) => progress,
            Ok(Stabilization::Pending { attempt }) => ProgressEvent::suspend(
                progress.resource_model,
                progress.callback_context,
                self.delay.delay_seconds(attempt),
            ),
            Ok(Stabilization::Exhausted) => match self.on_exhausted {
                ExhaustionPolicy::Accept => progress,
                ExhaustionPolicy::Fail(code) => {
                    let message = format!(
                        "{} did not stabilize after {} attempts",
                        self.name, self.max_attempts
                    );
                    ProgressEvent::failed(
                        progress.resource_model,
                        progress.callback_context,
                        code,
                        message,
                    )
                }
            },
            Err(fault) => handle_fault(progress, &fault, rules, sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::rules::{ErrorRule, ErrorRuleSet};
    use converge_schema::ErrorStatus;
    use std::cell::Cell;

    #[test]
    fn false_false_true_is_pending_pending_stable() {
        let answers = [false, false, true];
        let mut ctx = CallbackContext::new();
        let mut seen = Vec::new();
        for answer in answers {
            seen.push(probe(&mut ctx, "available", 3, &NullSink, || answer));
        }
        assert_eq!(
            seen,
            vec![
                Stabilization::Pending { attempt: 1 },
                Stabilization::Pending { attempt: 2 },
                Stabilization::Stable,
            ]
        );
    }

    #[test]
    fn stable_probe_is_latched() {
        let mut ctx = CallbackContext::new();
        assert!(await_stable(&mut ctx, "available", 3, || true));
        assert!(ctx.is_stabilized("available"));
        assert!(await_stable(&mut ctx, "available", 3, || panic!("re-evaluated")));
        assert_eq!(ctx.probe_attempts("available"), 0);
    }

    #[test]
    fn evaluations_are_bounded_by_max_attempts() {
        let evaluations = Cell::new(0);
        let mut ctx = CallbackContext::new();
        for _ in 0..10 {
            await_stable(&mut ctx, "available", 3, || {
                evaluations.set(evaluations.get() + 1);
                false
            });
        }
        assert_eq!(evaluations.get(), 3);
        assert_eq!(ctx.probe_attempts("available"), 3);
        assert!(!await_stable(&mut ctx, "available", 3, || true));
    }

    #[test]
    fn last_failed_attempt_reports_exhausted() {
        let mut ctx = CallbackContext::new();
        assert_eq!(
            probe(&mut ctx, "p", 1, &NullSink, || false),
            Stabilization::Exhausted
        );
    }

    #[test]
    fn zero_budget_never_evaluates() {
        let mut ctx = CallbackContext::new();
        let state = probe(&mut ctx, "p", 0, &NullSink, || panic!("evaluated"));
        assert_eq!(state, Stabilization::Exhausted);
    }

    #[test]
    fn counters_are_per_probe_name() {
        let mut ctx = CallbackContext::new();
        probe(&mut ctx, "a", 3, &NullSink, || false);
        probe(&mut ctx, "a", 3, &NullSink, || false);
        assert_eq!(
            probe(&mut ctx, "b", 3, &NullSink, || false),
            Stabilization::Pending { attempt: 1 }
        );
    }

    #[test]
    fn predicate_errors_do_not_spend_attempts() {
        let mut ctx = CallbackContext::new();
        let result: Result<_, &str> = try_probe(&mut ctx, "p", 2, &NullSink, || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert_eq!(ctx.probe_attempts("p"), 0);
    }

    #[test]
    fn probe_emits_events() {
        let sink = RecordingSink::new();
        let mut ctx = CallbackContext::new();
        probe(&mut ctx, "p", 1, &sink, || false);
        let events = sink.events();
        assert!(matches!(
            events.as_slice(),
            [
                Event::ProbeEvaluated { attempt: 1, stable: false, .. },
                Event::ProbeExhausted { max_attempts: 1, .. }
            ]
        ));
    }

    #[test]
    fn delay_strategies() {
        let constant = DelayPolicy::constant(30);
        assert_eq!(constant.delay_seconds(1), 30);
        assert_eq!(constant.delay_seconds(5), 30);

        let linear = DelayPolicy {
            strategy: BackoffStrategy::Linear,
            base_seconds: 10,
            max_seconds: None,
        };
        assert_eq!(linear.delay_seconds(1), 10);
        assert_eq!(linear.delay_seconds(3), 30);

        let exp = DelayPolicy::exponential(5, 60);
        assert_eq!(exp.delay_seconds(1), 5);
        assert_eq!(exp.delay_seconds(2), 10);
        assert_eq!(exp.delay_seconds(3), 20);
        assert_eq!(exp.delay_seconds(10), 60);
    }

    #[test]
    fn delay_is_never_zero() {
        assert_eq!(DelayPolicy::constant(0).delay_seconds(1), 1);
    }

    #[test]
    fn wait_suspends_then_continues() {
        let probe = Probe::new("available", 3, DelayPolicy::constant(15));
        let rules = ErrorRuleSet::default();
        let p = ProgressEvent::progress((), CallbackContext::new());

        let p = probe.wait(p, &rules, &NullSink, |_| Ok(false));
        assert_eq!(p.callback_delay_seconds, 15);
        assert!(!p.can_continue());

        let resumed = ProgressEvent::progress((), p.callback_context);
        let p = probe.wait(resumed, &rules, &NullSink, |_| Ok(true));
        assert!(p.can_continue());
    }

    #[test]
    fn wait_fails_when_exhausted() {
        let probe = Probe::new("available", 1, DelayPolicy::default());
        let p = ProgressEvent::progress((), CallbackContext::new());
        let p = probe.wait(p, &ErrorRuleSet::default(), &NullSink, |_| Ok(false));
        assert!(p.is_failed());
        assert_eq!(p.error_code, Some(HandlerErrorCode::NotStabilized));
    }

    #[test]
    fn wait_accepts_exhaustion_when_best_effort() {
        let probe = Probe::new("rebooted", 1, DelayPolicy::default())
            .on_exhausted(ExhaustionPolicy::Accept);
        let p = ProgressEvent::progress((), CallbackContext::new());
        let p = probe.wait(p, &ErrorRuleSet::default(), &NullSink, |_| Ok(false));
        assert!(p.can_continue());
    }

    #[test]
    fn wait_classifies_predicate_faults() {
        let probe = Probe::new("available", 3, DelayPolicy::default());
        let rules = ErrorRuleSet::new(vec![ErrorRule::by_code(
            "DBInstanceNotFound",
            ErrorStatus::FailWith(HandlerErrorCode::NotFound),
        )]);
        let p = ProgressEvent::progress((), CallbackContext::new());
        let p = probe.wait(p, &rules, &NullSink, |_| {
            Err(Fault::service("DBInstanceNotFound", "gone"))
        });
        assert_eq!(p.error_code, Some(HandlerErrorCode::NotFound));
    }

    #[test]
    fn disabled_probe_passes_through() {
        let config = HandlerConfig {
            probing_enabled: false,
            ..HandlerConfig::default()
        };
        let probe = Probe::from_config("available", &config);
        let p = ProgressEvent::progress((), CallbackContext::new());
        let p = probe.wait(p, &ErrorRuleSet::default(), &NullSink, |_| Ok(false));
        assert!(p.can_continue());
        assert_eq!(p.callback_context.probe_attempts("available"), 0);
    }
}
