//! Mock implementations of Ralph's collaborator traits.
//!
//! These mocks provide controllable test doubles for the engine, the
//! operator, observers, and the state store, enabling deterministic tests of
//! the executor and loop controller.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{
    EngineClient, EngineError, EngineEvent, EngineSession, ResultRecord, SessionOptions, Usage,
};
use crate::error::{RalphError, Result};
use crate::executor::IterationOutcome;
use crate::observer::IterationObserver;
use crate::operator::Operator;
use crate::r#loop::state::LoopState;
use crate::sandbox::{PermissionDecision, Question, QuestionHandler, ToolGate};
use crate::session::StateStore;
use crate::signals::{ControlSignals, Signal};

/// One scripted step of a turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Surface an event.
    Event(EngineEvent),
    /// Raise a control latch, as if the operator pressed a key at this point.
    Raise(Signal),
    /// Fail the next read.
    Fail(EngineError),
    /// End the stream.
    End,
}

/// What the engine does in response to one `send`.
///
/// # Example
///
/// ```rust,ignore
/// let turn = TurnScript::new()
///     .text("Working on it")
///     .tool_use("Read", json!({"file_path": "src/lib.rs"}))
///     .succeed();
/// ```
#[derive(Debug, Clone, Default)]
pub struct TurnScript {
    steps: Vec<ScriptStep>,
}

/// A successful result record with zero usage.
#[must_use]
pub fn result_record(success: bool) -> ResultRecord {
    ResultRecord {
        success,
        duration_ms: 1_000,
        num_turns: 1,
        usage: Usage::default(),
        cost_usd: 0.01,
        result_text: None,
    }
}

impl TurnScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn event(self, event: EngineEvent) -> Self {
        self.step(ScriptStep::Event(event))
    }

    #[must_use]
    pub fn text(self, text: impl Into<String>) -> Self {
        self.event(EngineEvent::AssistantText(text.into()))
    }

    #[must_use]
    pub fn thinking(self, text: impl Into<String>) -> Self {
        self.event(EngineEvent::Thinking(text.into()))
    }

    /// A tool call. The session's tool gate is consulted when it is reached.
    #[must_use]
    pub fn tool_use(self, name: &str, input: Value) -> Self {
        let id = format!("toolu_{}", self.steps.len() + 1);
        self.event(EngineEvent::ToolUse {
            id,
            name: name.to_string(),
            input,
        })
    }

    #[must_use]
    pub fn tool_result(self, id: &str, content: &str) -> Self {
        self.event(EngineEvent::ToolResult {
            id: id.to_string(),
            content: content.to_string(),
        })
    }

    #[must_use]
    pub fn raise(self, signal: Signal) -> Self {
        self.step(ScriptStep::Raise(signal))
    }

    #[must_use]
    pub fn fail(self, error: EngineError) -> Self {
        self.step(ScriptStep::Fail(error))
    }

    #[must_use]
    pub fn end(self) -> Self {
        self.step(ScriptStep::End)
    }

    #[must_use]
    pub fn result(self, record: ResultRecord) -> Self {
        self.event(EngineEvent::Result(record))
    }

    /// Finish the turn successfully.
    #[must_use]
    pub fn succeed(self) -> Self {
        self.result(result_record(true))
    }

    /// Finish the turn successfully with an authoritative result text.
    #[must_use]
    pub fn succeed_with_text(self, text: impl Into<String>) -> Self {
        self.result(ResultRecord {
            result_text: Some(text.into()),
            ..result_record(true)
        })
    }

    /// Finish the turn successfully with the given usage.
    #[must_use]
    pub fn succeed_with_usage(self, usage: Usage) -> Self {
        self.result(ResultRecord {
            usage,
            ..result_record(true)
        })
    }

    /// Finish the turn with an error result.
    #[must_use]
    pub fn error_result(self, text: impl Into<String>) -> Self {
        self.result(ResultRecord {
            result_text: Some(text.into()),
            ..result_record(false)
        })
    }
}

/// The turns of one session, consumed one per `send`.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    turns: Vec<TurnScript>,
}

impl SessionScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn turn(mut self, turn: TurnScript) -> Self {
        self.turns.push(turn);
        self
    }
}

#[derive(Default)]
struct MockLog {
    sent: Vec<String>,
    options: Vec<SessionOptions>,
    decisions: Vec<(String, PermissionDecision)>,
    opened: usize,
    closed: usize,
    interrupts: usize,
}

struct MockState {
    sessions: Mutex<VecDeque<std::result::Result<SessionScript, EngineError>>>,
    log: Mutex<MockLog>,
    signals: Mutex<Option<ControlSignals>>,
}

/// Scripted engine.
///
/// Each `open` consumes the next queued session script. Clones share the
/// queue and the recorded calls, so a test can keep one handle for
/// assertions.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Arc::new(MockState {
                sessions: Mutex::new(VecDeque::new()),
                log: Mutex::new(MockLog::default()),
                signals: Mutex::new(None),
            }),
        }
    }
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches targeted by [`ScriptStep::Raise`].
    #[must_use]
    pub fn with_signals(self, signals: ControlSignals) -> Self {
        if let Ok(mut slot) = self.state.signals.lock() {
            *slot = Some(signals);
        }
        self
    }

    /// Queue a session.
    #[must_use]
    pub fn with_session(self, script: SessionScript) -> Self {
        if let Ok(mut sessions) = self.state.sessions.lock() {
            sessions.push_back(Ok(script));
        }
        self
    }

    /// Queue a single-turn session.
    #[must_use]
    pub fn with_turn(self, turn: TurnScript) -> Self {
        self.with_session(SessionScript::new().turn(turn))
    }

    /// Queue one single-turn session per entry.
    #[must_use]
    pub fn with_turns(self, turns: impl IntoIterator<Item = TurnScript>) -> Self {
        turns.into_iter().fold(self, Self::with_turn)
    }

    /// Queue a session that fails to open.
    #[must_use]
    pub fn with_open_error(self, error: EngineError) -> Self {
        if let Ok(mut sessions) = self.state.sessions.lock() {
            sessions.push_back(Err(error));
        }
        self
    }

    fn with_log<T>(&self, f: impl FnOnce(&MockLog) -> T) -> T {
        let log = self.state.log.lock().unwrap_or_else(|e| e.into_inner());
        f(&log)
    }

    /// Every message sent, across sessions.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.with_log(|l| l.sent.clone())
    }

    /// Options of every successfully opened session.
    #[must_use]
    pub fn options(&self) -> Vec<SessionOptions> {
        self.with_log(|l| l.options.clone())
    }

    /// Tool gate decisions, in order.
    #[must_use]
    pub fn decisions(&self) -> Vec<(String, PermissionDecision)> {
        self.with_log(|l| l.decisions.clone())
    }

    #[must_use]
    pub fn opened(&self) -> usize {
        self.with_log(|l| l.opened)
    }

    #[must_use]
    pub fn closed(&self) -> usize {
        self.with_log(|l| l.closed)
    }

    #[must_use]
    pub fn interrupts(&self) -> usize {
        self.with_log(|l| l.interrupts)
    }

    /// Sessions still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.state.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn open(&self, options: SessionOptions) -> std::result::Result<Box<dyn EngineSession>, EngineError> {
        let next = self
            .state
            .sessions
            .lock()
            .map_err(|_| EngineError::protocol("mock poisoned"))?
            .pop_front();

        let script = match next {
            Some(Ok(script)) => script,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(EngineError::Spawn {
                    message: "no scripted session left".to_string(),
                })
            }
        };

        let gate = Arc::clone(&options.tool_gate);
        if let Ok(mut log) = self.state.log.lock() {
            log.opened += 1;
            log.options.push(options);
        }

        let signals = self.state.signals.lock().ok().and_then(|s| s.clone());
        Ok(Box::new(MockSession {
            turns: script.turns.into_iter().collect(),
            current: VecDeque::new(),
            engine: self.clone(),
            signals,
            gate,
            closed: false,
        }))
    }
}

struct MockSession {
    turns: VecDeque<TurnScript>,
    current: VecDeque<ScriptStep>,
    engine: MockEngine,
    signals: Option<ControlSignals>,
    gate: Arc<dyn ToolGate>,
    closed: bool,
}

impl MockSession {
    fn record(&self, f: impl FnOnce(&mut MockLog)) {
        if let Ok(mut log) = self.engine.state.log.lock() {
            f(&mut log);
        }
    }

    /// Apply latches scripted right after the last surfaced event.
    fn apply_raises(&mut self) {
        while let Some(ScriptStep::Raise(signal)) = self.current.front() {
            let signal = *signal;
            self.current.pop_front();
            if let Some(signals) = &self.signals {
                signals.set(signal);
            }
        }
    }
}

#[async_trait]
impl EngineSession for MockSession {
    async fn send(&mut self, text: &str) -> std::result::Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        let text = text.to_string();
        self.record(|log| log.sent.push(text));
        self.current = self
            .turns
            .pop_front()
            .map(|t| t.steps.into_iter().collect())
            .unwrap_or_default();
        self.apply_raises();
        Ok(())
    }

    async fn next_event(&mut self) -> std::result::Result<Option<EngineEvent>, EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        self.apply_raises();
        let event = match self.current.pop_front() {
            None | Some(ScriptStep::End) => return Ok(None),
            Some(ScriptStep::Fail(e)) => return Err(e),
            Some(ScriptStep::Raise(_)) => return Err(EngineError::protocol("unapplied raise")),
            Some(ScriptStep::Event(event)) => event,
        };

        let event = match event {
            EngineEvent::ToolUse { id, name, input } => {
                let decision = self.gate.check(&name, &input);
                let input = match &decision {
                    PermissionDecision::Allow {
                        updated_input: Some(updated),
                    } => updated.clone(),
                    _ => input,
                };
                if let PermissionDecision::Deny { message } = &decision {
                    self.current.push_front(ScriptStep::Event(EngineEvent::ToolResult {
                        id: id.clone(),
                        content: message.clone(),
                    }));
                }
                let recorded = (name.clone(), decision);
                self.record(|log| log.decisions.push(recorded));
                EngineEvent::ToolUse { id, name, input }
            }
            other => other,
        };

        self.apply_raises();
        Ok(Some(event))
    }

    async fn interrupt(&mut self) -> std::result::Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        self.record(|log| log.interrupts += 1);
        self.current.clear();
        Ok(())
    }

    async fn close(&mut self) -> std::result::Result<(), EngineError> {
        if !self.closed {
            self.closed = true;
            self.record(|log| log.closed += 1);
        }
        Ok(())
    }
}

/// One observed callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    IterationStart { iteration: u32, total: u32 },
    Task { id: String, description: String },
    AssistantText(String),
    Thinking(String),
    ToolUse { name: String, input: Value },
    ToolResult { id: String, content: String },
    Result(ResultRecord),
    Intervention(String),
    IterationEnd { iteration: u32, outcome: IterationOutcome },
    Status(String),
}

/// Observer that records every callback.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ObservedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn collect<T>(&self, f: impl Fn(&ObservedEvent) -> Option<T>) -> Vec<T> {
        self.events().iter().filter_map(f).collect()
    }

    #[must_use]
    pub fn thinking(&self) -> Vec<String> {
        self.collect(|e| match e {
            ObservedEvent::Thinking(t) => Some(t.clone()),
            _ => None,
        })
    }

    #[must_use]
    pub fn tool_uses(&self) -> Vec<(String, Value)> {
        self.collect(|e| match e {
            ObservedEvent::ToolUse { name, input } => Some((name.clone(), input.clone())),
            _ => None,
        })
    }

    #[must_use]
    pub fn interventions(&self) -> Vec<String> {
        self.collect(|e| match e {
            ObservedEvent::Intervention(t) => Some(t.clone()),
            _ => None,
        })
    }

    /// Iteration indices that started, in order.
    #[must_use]
    pub fn iteration_starts(&self) -> Vec<u32> {
        self.collect(|e| match e {
            ObservedEvent::IterationStart { iteration, .. } => Some(*iteration),
            _ => None,
        })
    }

    #[must_use]
    pub fn iteration_ends(&self) -> Vec<(u32, IterationOutcome)> {
        self.collect(|e| match e {
            ObservedEvent::IterationEnd { iteration, outcome } => {
                Some((*iteration, outcome.clone()))
            }
            _ => None,
        })
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<String> {
        self.collect(|e| match e {
            ObservedEvent::Status(s) => Some(s.clone()),
            _ => None,
        })
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<(String, String)> {
        self.collect(|e| match e {
            ObservedEvent::Task { id, description } => Some((id.clone(), description.clone())),
            _ => None,
        })
    }
}

impl IterationObserver for RecordingObserver {
    fn on_iteration_start(&self, iteration: u32, total: u32) {
        self.push(ObservedEvent::IterationStart { iteration, total });
    }

    fn on_task(&self, task_id: &str, description: &str) {
        self.push(ObservedEvent::Task {
            id: task_id.to_string(),
            description: description.to_string(),
        });
    }

    fn on_assistant_text(&self, text: &str) {
        self.push(ObservedEvent::AssistantText(text.to_string()));
    }

    fn on_thinking(&self, text: &str) {
        self.push(ObservedEvent::Thinking(text.to_string()));
    }

    fn on_tool_use(&self, name: &str, input: &Value) {
        self.push(ObservedEvent::ToolUse {
            name: name.to_string(),
            input: input.clone(),
        });
    }

    fn on_tool_result(&self, id: &str, content: &str) {
        self.push(ObservedEvent::ToolResult {
            id: id.to_string(),
            content: content.to_string(),
        });
    }

    fn on_result(&self, record: &ResultRecord) {
        self.push(ObservedEvent::Result(record.clone()));
    }

    fn on_intervention(&self, text: &str) {
        self.push(ObservedEvent::Intervention(text.to_string()));
    }

    fn on_iteration_end(&self, iteration: u32, outcome: &IterationOutcome) {
        self.push(ObservedEvent::IterationEnd {
            iteration,
            outcome: outcome.clone(),
        });
    }

    fn on_status(&self, message: &str) {
        self.push(ObservedEvent::Status(message.to_string()));
    }
}

/// Operator with canned replies, handed out in order.
///
/// Once the replies run out every request is answered with `None`.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    replies: Mutex<VecDeque<Option<String>>>,
    answers: BTreeMap<String, String>,
    asked: AtomicUsize,
}

impl ScriptedOperator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an intervention message.
    #[must_use]
    pub fn reply(self, text: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Some(text.to_string()));
        }
        self
    }

    /// Queue an empty intervention.
    #[must_use]
    pub fn cancel(self) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(None);
        }
        self
    }

    /// Answer `question` with `answer` when asked.
    #[must_use]
    pub fn with_answer(mut self, question: &str, answer: &str) -> Self {
        self.answers.insert(question.to_string(), answer.to_string());
        self
    }

    /// Number of interventions and question batches handled.
    #[must_use]
    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn intervention(&self) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .flatten()
    }
}

impl QuestionHandler for ScriptedOperator {
    fn answer(&self, questions: &[Question]) -> BTreeMap<String, String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        questions
            .iter()
            .map(|q| {
                let answer = self.answers.get(&q.question).cloned().unwrap_or_default();
                (q.question.clone(), answer)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    state: Option<LoopState>,
    saves: usize,
    clears: usize,
}

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryLog>,
    fail_writes: bool,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing record.
    #[must_use]
    pub fn with_state(self, state: LoopState) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = Some(state);
        }
        self
    }

    /// Make every save and clear fail.
    #[must_use]
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    #[must_use]
    pub fn current(&self) -> Option<LoopState> {
        self.inner.lock().ok().and_then(|i| i.state.clone())
    }

    #[must_use]
    pub fn saves(&self) -> usize {
        self.inner.lock().map(|i| i.saves).unwrap_or(0)
    }

    #[must_use]
    pub fn clears(&self) -> usize {
        self.inner.lock().map(|i| i.clears).unwrap_or(0)
    }

    fn poisoned() -> RalphError {
        RalphError::state("memory store poisoned")
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<LoopState>> {
        let inner = self.inner.lock().map_err(|_| Self::poisoned())?;
        Ok(inner.state.clone().filter(LoopState::is_well_formed))
    }

    fn save(&self, state: &LoopState) -> Result<()> {
        if self.fail_writes {
            return Err(RalphError::Other(anyhow!("disk full")));
        }
        let mut inner = self.inner.lock().map_err(|_| Self::poisoned())?;
        inner.state = Some(state.clone());
        inner.saves += 1;
        Ok(())
    }

    fn clear(&self) -> Result<bool> {
        if self.fail_writes {
            return Err(RalphError::Other(anyhow!("disk full")));
        }
        let mut inner = self.inner.lock().map_err(|_| Self::poisoned())?;
        inner.clears += 1;
        Ok(inner.state.take().is_some())
    }
}
