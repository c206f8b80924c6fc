//! Strictly ordered step composition over a [`ProgressEvent`].
//!
//! Every step receives the record produced by the previous one. The pipeline
//! stops as soon as a record can no longer continue: failed, succeeded, or
//! suspended with a resume delay. Re-invocations start again from the first
//! step and rely on [`exec_once`] flags and probe counters to skip finished work.

use crate::events::{Event, EventSink};
use crate::progress::ProgressEvent;

type StepFn<'a, M> = Box<dyn FnOnce(ProgressEvent<M>) -> ProgressEvent<M> + 'a>;

struct Step<'a, M> {
    name: String,
    run: StepFn<'a, M>,
}

pub struct Pipeline<'a, M> {
    steps: Vec<Step<'a, M>>,
    sink: &'a dyn EventSink,
}

impl<'a, M: 'a> Pipeline<'a, M> {
    pub fn new(sink: &'a dyn EventSink) -> Self {
        Self {
            steps: Vec::new(),
            sink,
        }
    }

    #[must_use]
    pub fn step(
        mut self,
        name: &str,
        run: impl FnOnce(ProgressEvent<M>) -> ProgressEvent<M> + 'a,
    ) -> Self {
        self.steps.push(Step {
            name: name.to_owned(),
            run: Box::new(run),
        });
        self
    }

    /// A step that passes the record through untouched when `condition` is false.
    #[must_use]
    pub fn step_if(
        self,
        name: &str,
        condition: impl FnOnce(&ProgressEvent<M>) -> bool + 'a,
        run: impl FnOnce(ProgressEvent<M>) -> ProgressEvent<M> + 'a,
    ) -> Self {
        self.step(name, move |progress| {
            if condition(&progress) {
                run(progress)
            } else {
                progress
            }
        })
    }

    /// A step guarded by the completion flag `flag`; see [`exec_once`].
    #[must_use]
    pub fn once(
        self,
        flag: &str,
        run: impl FnOnce(ProgressEvent<M>) -> ProgressEvent<M> + 'a,
    ) -> Self {
        let sink = self.sink;
        let flag_name = flag.to_owned();
        self.step(flag, move |progress| {
            if progress.callback_context.is_done(&flag_name) {
                sink.emit(&Event::StepSkipped {
                    step: flag_name.clone(),
                });
            }
            exec_once(progress, &flag_name, run)
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(self, initial: ProgressEvent<M>) -> ProgressEvent<M> {
        let sink = self.sink;
        let mut progress = initial;
        for step in self.steps {
            if !progress.can_continue() {
                sink.emit(&Event::Halted {
                    step: step.name,
                    status: progress.status,
                });
                break;
            }
            sink.emit(&Event::StepStarted {
                step: step.name.clone(),
            });
            progress = (step.run)(progress);
            sink.emit(&Event::StepFinished {
                step: step.name,
                status: progress.status,
                delay_seconds: progress.callback_delay_seconds,
            });
        }
        progress
    }
}

/// Run `step` at most once per logical operation.
///
/// When `flag` is already set in the record's context the record is returned
/// unchanged (in progress), so the pipeline moves on. Otherwise the step runs
/// and, unless it failed, `flag` is set on the context it returned.
pub fn exec_once<M>(
    progress: ProgressEvent<M>,
    flag: &str,
    step: impl FnOnce(ProgressEvent<M>) -> ProgressEvent<M>,
) -> ProgressEvent<M> {
    if progress.callback_context.is_done(flag) {
        return ProgressEvent {
            status: crate::progress::OperationStatus::InProgress,
            ..progress
        };
    }
    let mut result = step(progress);
    if !result.is_failed() {
        result.callback_context.mark_done(flag);
    }
    result
}
