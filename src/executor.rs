//! Iteration executor.
//!
//! Runs exactly one request/response cycle against the engine and folds it
//! into an [`IterationOutcome`]:
//!
//! ```text
//! open session ─► send instruction ─► ┌─ intervene latch? ─► interrupt, ask operator, send reply ─┐
//!                                     │                                                           │
//!                                     └─ next event ─► observers ─► … ─► Result ─► close session ◄┘
//! ```
//!
//! The executor never returns an error. Transport failures become a failed
//! outcome whose `error` carries the typed cause and whose `result_text` is
//! the error message.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::RalphConfig;
use crate::engine::{EngineClient, EngineError, EngineEvent, EngineSession, ResultRecord, SessionOptions};
use crate::observer::IterationObserver;
use crate::operator::Operator;
use crate::sandbox::{SandboxPolicy, ToolGate};
use crate::signals::{ControlSignals, Signal};

/// Marker the agent emits when the task is done.
pub const COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";

/// Marker the agent emits when spec discovery is done.
pub const SPEC_COMPLETE_MARKER: &str = "<promise>SPEC_COMPLETE</promise>";

/// Marker the agent emits when it is stuck.
pub const GUTTER_MARKER: &str = "<promise>GUTTER</promise>";

/// Instruction sent when the operator intervenes without a message.
pub const CONTINUE_MESSAGE: &str = "Continue with what you were doing.";

/// Whether `text` carries a task-complete or spec-complete marker.
#[must_use]
pub fn contains_completion(text: &str) -> bool {
    text.contains(COMPLETE_MARKER) || text.contains(SPEC_COMPLETE_MARKER)
}

/// Whether `text` carries the stuck marker.
#[must_use]
pub fn contains_gutter(text: &str) -> bool {
    text.contains(GUTTER_MARKER)
}

/// Context-window budget that drives automatic rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    pub context_limit: u64,
    pub rotate_threshold: f64,
    pub auto_gutter: bool,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::from_config(&RalphConfig::default())
    }
}

impl ContextBudget {
    #[must_use]
    pub fn from_config(config: &RalphConfig) -> Self {
        Self {
            context_limit: config.context_limit,
            rotate_threshold: config.rotate_threshold,
            auto_gutter: config.auto_gutter,
        }
    }

    /// Token count above which a fresh session is started.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.context_limit as f64 * self.rotate_threshold
    }

    /// Whether `input_tokens` strictly exceeds the threshold.
    ///
    /// # Example
    ///
    /// ```
    /// use ralph::executor::ContextBudget;
    ///
    /// let budget = ContextBudget { context_limit: 200_000, rotate_threshold: 0.8, auto_gutter: true };
    /// assert!(!budget.exceeded(160_000));
    /// assert!(budget.exceeded(160_001));
    /// ```
    #[must_use]
    pub fn exceeded(&self, input_tokens: u64) -> bool {
        self.auto_gutter && input_tokens as f64 > self.threshold()
    }
}

/// Everything one iteration produced.
///
/// `is_gutter` holds iff at least one of `is_auto_gutter`, `is_user_gutter`,
/// or the stuck marker holds. Auto and user rotation may both be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationOutcome {
    pub success: bool,
    pub is_complete: bool,
    pub is_gutter: bool,
    pub is_auto_gutter: bool,
    pub is_user_gutter: bool,
    pub result_text: String,
    /// Input tokens including cache reads and cache creation.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
    /// Cause of a failed iteration.
    pub error: Option<EngineError>,
}

impl IterationOutcome {
    /// Rotation requested by the budget or the operator.
    #[must_use]
    pub fn is_rotation(&self) -> bool {
        self.is_gutter && (self.is_auto_gutter || self.is_user_gutter)
    }

    /// The agent itself reported being stuck.
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.is_gutter && !self.is_auto_gutter && !self.is_user_gutter
    }
}

/// Settings for the sessions the executor opens.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub model: String,
    pub budget: ContextBudget,
    pub mcp_config: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::loop_from(&RalphConfig::default())
    }
}

impl ExecutorConfig {
    /// Settings for loop iterations.
    #[must_use]
    pub fn loop_from(config: &RalphConfig) -> Self {
        Self {
            model: config.loop_model.clone(),
            budget: ContextBudget::from_config(config),
            mcp_config: config.mcp_config.clone(),
        }
    }

    /// Settings for spec discovery.
    #[must_use]
    pub fn spec_from(config: &RalphConfig) -> Self {
        Self {
            model: config.spec_model.clone(),
            ..Self::loop_from(config)
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }
}

#[derive(Default)]
struct Accumulated {
    text: String,
    record: Option<ResultRecord>,
}

/// Runs single iterations against an engine.
pub struct IterationExecutor {
    engine: Arc<dyn EngineClient>,
    signals: ControlSignals,
    operator: Arc<dyn Operator>,
    observer: Arc<dyn IterationObserver>,
    config: ExecutorConfig,
}

impl IterationExecutor {
    #[must_use]
    pub fn new(
        engine: Arc<dyn EngineClient>,
        signals: ControlSignals,
        operator: Arc<dyn Operator>,
        observer: Arc<dyn IterationObserver>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            engine,
            signals,
            operator,
            observer,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn signals(&self) -> &ControlSignals {
        &self.signals
    }

    #[must_use]
    pub fn observer(&self) -> &Arc<dyn IterationObserver> {
        &self.observer
    }

    /// Run one iteration of `instruction` under `policy` in a fresh session.
    pub async fn run(&self, instruction: &str, policy: Arc<SandboxPolicy>) -> IterationOutcome {
        let started = Instant::now();
        let mut acc = Accumulated::default();
        let result = self.drive(instruction, policy, &mut acc).await;
        self.finish(acc, result, started)
    }

    async fn drive(
        &self,
        instruction: &str,
        policy: Arc<SandboxPolicy>,
        acc: &mut Accumulated,
    ) -> Result<(), EngineError> {
        let options = SessionOptions {
            model: self.config.model.clone(),
            cwd: policy
                .working_dir()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            permission_mode: policy.permission_mode(),
            allowed_tools: policy.allowed_tools(),
            tool_gate: policy as Arc<dyn ToolGate>,
            mcp_config: self.config.mcp_config.clone(),
        };

        debug!(model = %options.model, mode = %options.permission_mode, "Opening engine session");
        let mut session = self.engine.open(options).await?;
        let result = self.consume(session.as_mut(), instruction, acc).await;
        if let Err(e) = session.close().await {
            warn!("Failed to close engine session: {e}");
        }
        result
    }

    async fn consume(
        &self,
        session: &mut dyn EngineSession,
        instruction: &str,
        acc: &mut Accumulated,
    ) -> Result<(), EngineError> {
        session.send(instruction).await?;

        loop {
            if self.signals.take(Signal::Intervene) {
                self.intervene(session).await?;
            }

            let Some(event) = session.next_event().await? else {
                return Err(EngineError::StreamEnded);
            };

            match event {
                EngineEvent::AssistantText(text) => {
                    acc.text.push_str(&text);
                    self.observer.on_assistant_text(&text);
                }
                EngineEvent::Thinking(text) => self.observer.on_thinking(&text),
                EngineEvent::ToolUse { name, input, .. } => self.observer.on_tool_use(&name, &input),
                EngineEvent::ToolResult { id, content } => self.observer.on_tool_result(&id, &content),
                EngineEvent::Result(record) => {
                    self.observer.on_result(&record);
                    acc.record = Some(record);
                    return Ok(());
                }
            }
        }
    }

    /// Interrupt the agent and hand it the operator's message.
    ///
    /// Blocks this iteration until the operator answers.
    async fn intervene(&self, session: &mut dyn EngineSession) -> Result<(), EngineError> {
        info!("Operator intervention requested");
        session.interrupt().await?;

        let message = match self.operator.intervention().await {
            Some(text) => {
                self.observer.on_intervention(&text);
                format!("[USER INTERVENTION] {text}")
            }
            None => {
                self.observer.on_intervention("(continue)");
                CONTINUE_MESSAGE.to_string()
            }
        };
        session.send(&message).await
    }

    fn finish(
        &self,
        acc: Accumulated,
        result: Result<(), EngineError>,
        started: Instant,
    ) -> IterationOutcome {
        let mut outcome = IterationOutcome {
            result_text: acc.text,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            ..IterationOutcome::default()
        };

        if let Some(record) = acc.record {
            outcome.success = record.success;
            outcome.input_tokens = record.usage.context_tokens();
            outcome.output_tokens = record.usage.output_tokens;
            outcome.cost_usd = record.cost_usd;
            outcome.duration_ms = record.duration_ms;
            outcome.num_turns = record.num_turns;
            if let Some(text) = record.result_text.filter(|t| !t.is_empty()) {
                outcome.result_text = text;
            }
        }

        if let Err(e) = result {
            warn!("Iteration failed: {e}");
            outcome.success = false;
            outcome.result_text = e.to_string();
            outcome.error = Some(e);
        }

        outcome.is_complete = contains_completion(&outcome.result_text);
        let stuck = contains_gutter(&outcome.result_text);
        outcome.is_user_gutter = self.signals.take(Signal::Gutter);
        outcome.is_auto_gutter = self.config.budget.exceeded(outcome.input_tokens);
        outcome.is_gutter = stuck || outcome.is_user_gutter || outcome.is_auto_gutter;

        if outcome.is_auto_gutter {
            info!(
                "Context usage ({}) exceeds {:.0}% threshold",
                outcome.input_tokens,
                self.config.budget.rotate_threshold * 100.0
            );
        }

        outcome
    }
}
