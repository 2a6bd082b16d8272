//! Loop controller.
//!
//! Drives the [`IterationExecutor`] over iterations `start..=total` and
//! decides after each one whether to continue, rotate, or stop:
//!
//! ```text
//!            ┌──────────── Continue / Rotate ◄─────────────┐
//!            v                                             │
//!   iteration i ─► outcome + latch snapshot ─► decide() ───┤
//!                                                          ├─► Complete   ─► Completed    (clear)
//!                                                          ├─► Stuck      ─► GutterStuck  (clear)
//!                                                          ├─► Error      ─► Errored      (save i)
//!                                                          ├─► Stop       ─► Stopped      (clear)
//!                                                          ├─► Pause      ─► Paused       (save i+1)
//!                                                          └─► Exhausted  ─► Exhausted    (clear)
//! ```
//!
//! [`decide`] is a pure function of the outcome, the latches, and the
//! position in the plan, so the precedence rules can be tested without an
//! engine.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{RalphError, Result};
use crate::executor::{IterationExecutor, IterationOutcome, SPEC_COMPLETE_MARKER};
use crate::r#loop::state::{LoopKind, LoopState};
use crate::sandbox::SandboxPolicy;
use crate::session::StateStore;
use crate::signals::{Signal, SignalSnapshot};
use crate::tasks::{NoTasks, TaskSource};

/// Called after every iteration with its index and outcome.
pub type IterationCallback = Arc<dyn Fn(u32, &IterationOutcome) + Send + Sync>;

/// What to run.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    pub instruction: String,
    pub policy: Arc<SandboxPolicy>,
    pub total_iterations: u32,
    /// First iteration to run (1-indexed). Anything above 1 is a resume.
    pub start_iteration: u32,
    pub loop_kind: LoopKind,
    /// Recorded in persisted state for display.
    pub target: Option<PathBuf>,
}

impl LoopPlan {
    #[must_use]
    pub fn new(instruction: impl Into<String>, policy: Arc<SandboxPolicy>, total_iterations: u32) -> Self {
        Self {
            instruction: instruction.into(),
            policy,
            total_iterations,
            start_iteration: 1,
            loop_kind: LoopKind::default(),
            target: None,
        }
    }

    #[must_use]
    pub fn starting_at(mut self, iteration: u32) -> Self {
        self.start_iteration = iteration;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: LoopKind) -> Self {
        self.loop_kind = kind;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Whether this run resumes an earlier one.
    #[must_use]
    pub fn is_resume(&self) -> bool {
        self.start_iteration != 1
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The agent reported the task done
    Completed,
    /// The operator stopped the run
    Stopped,
    /// The operator paused the run; resumable
    Paused,
    /// The agent reported being stuck
    GutterStuck,
    /// An iteration failed; resumable at the failed index
    Errored,
    /// The planned iterations ran out
    Exhausted,
}

impl LoopExit {
    /// Process exit status for this ending.
    ///
    /// # Example
    ///
    /// ```
    /// use ralph::r#loop::controller::LoopExit;
    ///
    /// assert_eq!(LoopExit::Paused.exit_code(), 0);
    /// assert_eq!(LoopExit::GutterStuck.exit_code(), 1);
    /// ```
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            LoopExit::Errored | LoopExit::GutterStuck => 1,
            LoopExit::Completed | LoopExit::Stopped | LoopExit::Paused | LoopExit::Exhausted => 0,
        }
    }

    /// Whether a later run can pick up where this one left off.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, LoopExit::Paused | LoopExit::Errored)
    }

    /// One-line explanation for the operator.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            LoopExit::Completed => "task complete",
            LoopExit::Stopped => "stopped by operator",
            LoopExit::Paused => "paused by operator, resume with --resume",
            LoopExit::GutterStuck => "agent is stuck, the task needs human attention",
            LoopExit::Errored => "iteration failed, resume with --resume to retry it",
            LoopExit::Exhausted => "iterations exhausted, the task may not be done",
        }
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopExit::Completed => "completed",
            LoopExit::Stopped => "stopped",
            LoopExit::Paused => "paused",
            LoopExit::GutterStuck => "gutter-stuck",
            LoopExit::Errored => "errored",
            LoopExit::Exhausted => "exhausted",
        };
        write!(f, "{name}")
    }
}

/// Next step after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTransition {
    Complete,
    /// Start the next iteration in a fresh session
    Rotate,
    Stuck,
    Error,
    Stop,
    Pause,
    Exhausted,
    Continue,
}

impl LoopTransition {
    /// The run ending this transition produces, if it ends the run.
    #[must_use]
    pub fn exit(self) -> Option<LoopExit> {
        match self {
            LoopTransition::Complete => Some(LoopExit::Completed),
            LoopTransition::Stuck => Some(LoopExit::GutterStuck),
            LoopTransition::Error => Some(LoopExit::Errored),
            LoopTransition::Stop => Some(LoopExit::Stopped),
            LoopTransition::Pause => Some(LoopExit::Paused),
            LoopTransition::Exhausted => Some(LoopExit::Exhausted),
            LoopTransition::Rotate | LoopTransition::Continue => None,
        }
    }
}

/// Decide what follows iteration `iteration` of `total`.
///
/// Precedence: completion, rotation, stuck, failure, stop, pause, end of
/// plan. Stop outranks pause. Rotation and pause on the last iteration
/// have nowhere to go and end the plan.
///
/// # Example
///
/// ```
/// use ralph::executor::IterationOutcome;
/// use ralph::r#loop::controller::{decide, LoopTransition};
/// use ralph::signals::SignalSnapshot;
///
/// let outcome = IterationOutcome { success: true, ..Default::default() };
/// let latches = SignalSnapshot { stop: true, pause: true, ..Default::default() };
/// assert_eq!(decide(&outcome, latches, 3, 10), LoopTransition::Stop);
/// ```
#[must_use]
pub fn decide(
    outcome: &IterationOutcome,
    signals: SignalSnapshot,
    iteration: u32,
    total: u32,
) -> LoopTransition {
    let last = iteration >= total;

    if outcome.is_complete {
        return LoopTransition::Complete;
    }
    if outcome.is_rotation() {
        return if last {
            LoopTransition::Exhausted
        } else {
            LoopTransition::Rotate
        };
    }
    if outcome.is_gutter {
        return LoopTransition::Stuck;
    }
    if !outcome.success {
        return LoopTransition::Error;
    }
    if signals.stop {
        return LoopTransition::Stop;
    }
    if last {
        return LoopTransition::Exhausted;
    }
    if signals.pause {
        return LoopTransition::Pause;
    }
    LoopTransition::Continue
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub exit: LoopExit,
    /// Iterations executed by this run, resumed ones excluded.
    pub iterations_run: u32,
    /// Index of the last iteration executed, 0 if none ran.
    pub last_iteration: u32,
    pub rotations: u32,
    pub last_outcome: Option<IterationOutcome>,
}

impl LoopReport {
    fn new(exit: LoopExit) -> Self {
        Self {
            exit,
            iterations_run: 0,
            last_iteration: 0,
            rotations: 0,
            last_outcome: None,
        }
    }

    fn record(&mut self, iteration: u32, outcome: IterationOutcome) {
        self.iterations_run += 1;
        self.last_iteration = iteration;
        if outcome.is_rotation() {
            self.rotations += 1;
        }
        self.last_outcome = Some(outcome);
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit.exit_code()
    }
}

/// Runs iterations and keeps the resumable record in step with them.
pub struct LoopController {
    executor: IterationExecutor,
    store: Arc<dyn StateStore>,
    tasks: Arc<dyn TaskSource>,
    on_iteration: Option<IterationCallback>,
}

impl LoopController {
    #[must_use]
    pub fn new(executor: IterationExecutor, store: Arc<dyn StateStore>) -> Self {
        Self {
            executor,
            store,
            tasks: Arc::new(NoTasks),
            on_iteration: None,
        }
    }

    /// Source of the task name shown before each iteration and saved on pause.
    #[must_use]
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskSource>) -> Self {
        self.tasks = tasks;
        self
    }

    #[must_use]
    pub fn with_on_iteration(mut self, callback: IterationCallback) -> Self {
        self.on_iteration = Some(callback);
        self
    }

    #[must_use]
    pub fn executor(&self) -> &IterationExecutor {
        &self.executor
    }

    /// Run `plan` to one of the terminal states.
    ///
    /// Starting at iteration 1 discards any stale record first; a resumed
    /// plan leaves it in place until the run ends.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::InvalidResume`] when the start index lies
    /// outside `1..=total_iterations`. Persistence failures are logged and
    /// never end the run.
    pub async fn run(&self, plan: &LoopPlan) -> Result<LoopReport> {
        let total = plan.total_iterations;
        let start = plan.start_iteration;
        if total == 0 || start == 0 || start > total {
            return Err(RalphError::InvalidResume { start, total });
        }

        if plan.is_resume() {
            info!("Resuming at iteration {start}/{total}");
        } else {
            self.clear_state();
        }

        let signals = self.executor.signals().clone();
        let mut report = LoopReport::new(LoopExit::Exhausted);

        for iteration in start..=total {
            let outcome = self.iterate(&plan.instruction, &plan.policy, iteration, total).await;
            let transition = decide(&outcome, signals.snapshot(), iteration, total);
            report.record(iteration, outcome);
            debug!(iteration, ?transition, "Iteration finished");

            match transition {
                LoopTransition::Continue => {}
                LoopTransition::Rotate => {
                    self.status("Rotating to a fresh context");
                }
                LoopTransition::Stop => {
                    signals.take(Signal::Stop);
                    signals.clear(Signal::Pause);
                    self.status(&format!("Stopped at iteration {iteration}"));
                    self.clear_state();
                    report.exit = LoopExit::Stopped;
                    return Ok(report);
                }
                LoopTransition::Pause => {
                    signals.take(Signal::Pause);
                    self.status(&format!("Paused at iteration {iteration}"));
                    self.save_state(plan, iteration + 1);
                    report.exit = LoopExit::Paused;
                    return Ok(report);
                }
                LoopTransition::Error => {
                    self.status(&format!("Iteration {iteration} failed"));
                    self.save_state(plan, iteration);
                    report.exit = LoopExit::Errored;
                    return Ok(report);
                }
                LoopTransition::Complete | LoopTransition::Stuck | LoopTransition::Exhausted => {
                    if transition == LoopTransition::Stuck {
                        self.status("Agent reported it is stuck");
                    }
                    signals.clear(Signal::Pause);
                    self.clear_state();
                    report.exit = transition.exit().unwrap_or(LoopExit::Exhausted);
                    return Ok(report);
                }
            }
        }

        self.clear_state();
        Ok(report)
    }

    /// Run a single iteration with no persisted state.
    pub async fn run_once(&self, instruction: &str, policy: Arc<SandboxPolicy>) -> LoopReport {
        let outcome = self.iterate(instruction, &policy, 1, 1).await;
        let exit = if outcome.is_complete {
            LoopExit::Completed
        } else if !outcome.success {
            LoopExit::Errored
        } else {
            LoopExit::Exhausted
        };

        let mut report = LoopReport::new(exit);
        report.record(1, outcome);
        report
    }

    /// Spec discovery: iterate until the spec-complete marker, a failure,
    /// a stop, or `max_iterations`. No persisted state is touched.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::InvalidResume`] when `max_iterations` is zero.
    pub async fn run_spec(
        &self,
        instruction: &str,
        policy: Arc<SandboxPolicy>,
        max_iterations: u32,
    ) -> Result<LoopReport> {
        if max_iterations == 0 {
            return Err(RalphError::InvalidResume {
                start: 1,
                total: max_iterations,
            });
        }

        let signals = self.executor.signals().clone();
        let mut report = LoopReport::new(LoopExit::Exhausted);

        for iteration in 1..=max_iterations {
            let outcome = self.iterate(instruction, &policy, iteration, max_iterations).await;
            let done = outcome.result_text.contains(SPEC_COMPLETE_MARKER);
            let failed = !outcome.success;
            report.record(iteration, outcome);

            if done {
                self.status("Spec complete");
                report.exit = LoopExit::Completed;
                return Ok(report);
            }
            if failed {
                report.exit = LoopExit::Errored;
                return Ok(report);
            }
            if signals.take(Signal::Stop) {
                self.status(&format!("Stopped at spec iteration {iteration}"));
                report.exit = LoopExit::Stopped;
                return Ok(report);
            }
        }

        Ok(report)
    }

    async fn iterate(
        &self,
        instruction: &str,
        policy: &Arc<SandboxPolicy>,
        iteration: u32,
        total: u32,
    ) -> IterationOutcome {
        let observer = self.executor.observer();
        info!("Starting iteration {iteration}/{total}");
        observer.on_iteration_start(iteration, total);
        if let Some(task) = self.tasks.current() {
            observer.on_task(&task.id, &task.label());
        }

        let outcome = self.executor.run(instruction, Arc::clone(policy)).await;

        observer.on_iteration_end(iteration, &outcome);
        if let Some(callback) = &self.on_iteration {
            callback(iteration, &outcome);
        }
        outcome
    }

    fn status(&self, message: &str) {
        info!("{message}");
        self.executor.observer().on_status(message);
    }

    fn save_state(&self, plan: &LoopPlan, next_iteration: u32) {
        let mut state = LoopState::paused(next_iteration, plan.total_iterations, plan.loop_kind);
        if let Some(task) = self.tasks.current() {
            state = state.with_task(task.id, task.name);
        }
        if let Some(target) = &plan.target {
            state = state.with_target(target.clone());
        }

        if let Err(e) = self.store.save(&state) {
            warn!("Failed to save loop state: {e}");
        }
    }

    fn clear_state(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear loop state: {e}");
        }
    }
}
