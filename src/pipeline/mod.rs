//! Resumable execution of a target's step sequence.
//!
//! A target declares an [`ActionSequence`] and a [`HandlerTable`]. The
//! [`Pipeline`] runs the steps one at a time against a [`BuildContext`]:
//!
//! ```text
//! Pending ──► Running(0) ──► Running(1) ──► … ──► Completed
//!                  │              │
//!                  └──────────────┴──► Aborted { step }
//! ```
//!
//! With the `autoresume` option, steps that recorded a resume point in an
//! earlier run are skipped. Any step failure unbinds the chroot before the
//! error leaves the pipeline; resume points are left as they are so a retry
//! continues after the last completed step.

mod context;
mod step;

pub use context::{compress_maps, BuildContext};
pub use step::Step;

use std::collections::BTreeMap;

use crate::error::PipelineError;

/// A step body.
pub type StepFn = fn(&mut BuildContext) -> anyhow::Result<()>;

/// Handlers registered for a target.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<Step, StepFn>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `step`.
    pub fn register(&mut self, step: Step, handler: StepFn) -> &mut Self {
        self.handlers.insert(step, handler);
        self
    }

    pub fn with(mut self, step: Step, handler: StepFn) -> Self {
        self.register(step, handler);
        self
    }

    pub fn get(&self, step: Step) -> Option<StepFn> {
        self.handlers.get(&step).copied()
    }

    pub fn contains(&self, step: Step) -> bool {
        self.handlers.contains_key(&step)
    }
}

/// Ordered steps, each known to have a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSequence {
    steps: Vec<Step>,
}

impl ActionSequence {
    pub fn new(steps: Vec<Step>, handlers: &HandlerTable) -> Result<Self, PipelineError> {
        if let Some(missing) = steps.iter().find(|s| !handlers.contains(**s)) {
            return Err(PipelineError::Unresolvable(missing.name()));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running(usize),
    Completed,
    Aborted(Step),
}

/// Executes one target's sequence.
#[derive(Debug)]
pub struct Pipeline {
    target_key: String,
    sequence: ActionSequence,
    handlers: HandlerTable,
    state: RunState,
}

impl Pipeline {
    pub fn new(
        target_key: impl Into<String>,
        steps: Vec<Step>,
        handlers: HandlerTable,
    ) -> Result<Self, PipelineError> {
        let sequence = ActionSequence::new(steps, &handlers)?;
        Ok(Self {
            target_key: target_key.into(),
            sequence,
            handlers,
            state: RunState::Pending,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn sequence(&self) -> &ActionSequence {
        &self.sequence
    }

    /// Run every step in order.
    pub fn run(&mut self, ctx: &mut BuildContext) -> Result<(), PipelineError> {
        let _lock = ctx
            .store
            .lock(&self.target_key)
            .map_err(|e| match e.downcast::<PipelineError>() {
                Ok(locked) => locked,
                Err(other) => PipelineError::Setup(other.into()),
            })?;

        let autoresume = ctx.has_option("autoresume");
        if autoresume {
            let removed = ctx
                .resume
                .retain(&self.sequence.names())
                .map_err(|e| PipelineError::Setup(e.into()))?;
            for point in removed {
                tracing::warn!("dropping resume point '{}' not in this target's sequence", point);
            }
        } else {
            // A fresh run starts from nothing; markers left by an aborted
            // run would otherwise be read by a later autoresume run.
            ctx.resume
                .clear()
                .map_err(|e| PipelineError::Setup(e.into()))?;
        }

        let total = self.sequence.steps.len();
        for (index, step) in self.sequence.steps.clone().into_iter().enumerate() {
            self.state = RunState::Running(index);

            if autoresume && step.is_resumable() && ctx.resume.is_enabled(step.name()) {
                tracing::info!("Resume point detected, skipping {}", step);
                continue;
            }

            let Some(handler) = self.handlers.get(step) else {
                return Err(self.abort(ctx, step, PipelineError::Unresolvable(step.name()).into()));
            };

            tracing::info!("[{}/{}] {}", index + 1, total, step);
            let outcome = handler(ctx).and_then(|()| {
                if step.is_resumable() {
                    ctx.resume.enable(step.name())?;
                }
                Ok(())
            });
            if let Err(e) = outcome {
                return Err(self.abort(ctx, step, e.into()));
            }
        }

        if ctx.chroot.is_bound() {
            tracing::warn!("sequence ended with mounts bound, unbinding");
            if let Err(e) = ctx.chroot.unbind() {
                self.state = RunState::Aborted(*self.sequence.steps.last().unwrap_or(&Step::Unbind));
                return Err(PipelineError::StepFailed {
                    step: Step::Unbind.name(),
                    source: e.into(),
                });
            }
        }

        self.state = RunState::Completed;
        tracing::info!("{}: all steps completed", self.target_key);
        Ok(())
    }

    fn abort(
        &mut self,
        ctx: &mut BuildContext,
        step: Step,
        source: crate::error::BoxError,
    ) -> PipelineError {
        tracing::error!("step {} failed: {}", step, source);
        if ctx.chroot.is_bound() {
            if let Err(e) = ctx.chroot.unbind() {
                tracing::error!("unbind after failure: {}", e);
            }
        }
        self.state = RunState::Aborted(step);
        PipelineError::StepFailed {
            step: step.name(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut BuildContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn unresolvable_step_is_rejected() {
        let handlers = HandlerTable::new().with(Step::Unpack, noop);
        let err = Pipeline::new("t", vec![Step::Unpack, Step::Capture], handlers).unwrap_err();
        assert!(matches!(err, PipelineError::Unresolvable("capture")));
    }

    #[test]
    fn register_adds_and_replaces() {
        let mut handlers = HandlerTable::new().with(Step::Clean, noop);
        handlers.register(Step::Clean, noop).register(Step::Capture, noop);
        assert!(handlers.contains(Step::Clean));
        assert!(handlers.contains(Step::Capture));
        assert!(!handlers.contains(Step::Unpack));
        let sequence = ActionSequence::new(vec![Step::Clean, Step::Capture], &handlers).unwrap();
        assert_eq!(sequence.names(), vec!["clean", "capture"]);
    }
}
