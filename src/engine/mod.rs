//! Agent engine client interface.
//!
//! The engine is the external service that actually runs the agent: it
//! accepts instructions, executes tools, and reports progress as a stream of
//! events. Ralph only depends on the narrow contract defined here:
//!
//! ```text
//! EngineClient::open(SessionOptions) ──► EngineSession
//!                                          ├── send(text)
//!                                          ├── next_event() ──► EngineEvent
//!                                          ├── interrupt()
//!                                          └── close()
//! ```
//!
//! Engine messages are normalised into the closed [`EngineEvent`] enum at the
//! adapter boundary, so consumers match exhaustively instead of probing
//! optional fields.
//!
//! Before any file-touching tool executes, the engine must consult the
//! [`ToolGate`] supplied in [`SessionOptions`].

pub mod claude;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sandbox::ToolGate;

pub use claude::ClaudeCliEngine;

/// Transport-level failures talking to the engine.
///
/// These never escape an iteration: the executor converts them into a
/// failed outcome that carries the error as its payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine executable could not be located.
    #[error("Agent engine not found: {message}")]
    CliNotFound { message: String },

    /// The engine process could not be started.
    #[error("Failed to start agent engine: {message}")]
    Spawn { message: String },

    /// Reading from or writing to the engine failed.
    #[error("Agent engine connection error: {message}")]
    Transport { message: String },

    /// The engine sent something that violates the protocol.
    #[error("Agent engine protocol error: {message}")]
    Protocol { message: String },

    /// The engine process exited unexpectedly.
    #[error("Agent engine exited with code {code}: {stderr}")]
    Exited { code: i32, stderr: String },

    /// The event stream ended before a result was produced.
    #[error("Agent engine stream ended before a result was produced")]
    StreamEnded,

    /// An operation was attempted on a session that is not open.
    #[error("Agent engine session is not connected")]
    NotConnected,
}

impl EngineError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::transport(e.to_string())
    }
}

/// Token usage reported by the engine for one request/response cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Total input tokens including cache reads and cache creation.
    ///
    /// This sum is what occupies the context window, and is what gets
    /// compared against the context budget.
    #[must_use]
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}

/// The terminal record of an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub success: bool,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub usage: Usage,
    pub cost_usd: f64,
    /// Authoritative final text; supersedes accumulated assistant text.
    pub result_text: Option<String>,
}

/// A single event from the engine's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Visible assistant text.
    AssistantText(String),
    /// Reasoning trace; never part of the result text.
    Thinking(String),
    /// The agent invoked a tool (already cleared by the tool gate).
    ToolUse { id: String, name: String, input: Value },
    /// Output of a tool invocation.
    ToolResult { id: String, content: String },
    /// End of the request/response cycle.
    Result(ResultRecord),
}

/// How the engine should treat edits and plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Edits are applied without an extra confirmation step.
    AcceptEdits,
    /// Read-only planning; the engine refuses to modify files.
    Plan,
    /// Engine default behaviour.
    Default,
}

impl PermissionMode {
    /// The flag value understood by the engine.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open an engine session.
#[derive(Clone)]
pub struct SessionOptions {
    pub model: String,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    /// Consulted before every tool call.
    pub tool_gate: Arc<dyn ToolGate>,
    /// Extra tool server configuration handed to the engine as-is.
    pub mcp_config: Option<PathBuf>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("model", &self.model)
            .field("cwd", &self.cwd)
            .field("permission_mode", &self.permission_mode)
            .field("allowed_tools", &self.allowed_tools)
            .field("mcp_config", &self.mcp_config)
            .finish_non_exhaustive()
    }
}

/// Opens engine sessions.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Open a new session with a fresh context.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be started or connected to.
    async fn open(&self, options: SessionOptions) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// One live engine session.
#[async_trait]
pub trait EngineSession: Send {
    /// Send an instruction as a new user turn.
    async fn send(&mut self, text: &str) -> Result<(), EngineError>;

    /// Wait for the next event. `Ok(None)` means the stream has ended.
    async fn next_event(&mut self) -> Result<Option<EngineEvent>, EngineError>;

    /// Interrupt the turn currently in flight.
    ///
    /// The terminal record of the interrupted turn is not surfaced through
    /// [`EngineSession::next_event`].
    async fn interrupt(&mut self) -> Result<(), EngineError>;

    /// Close the session and release the engine.
    async fn close(&mut self) -> Result<(), EngineError>;
}
