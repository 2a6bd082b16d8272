//! Loop state types.
//!
//! [`LoopState`] is the record persisted between runs so a paused or failed
//! loop can be resumed at the right iteration.

use std::path::PathBuf;

use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Kind of loop being run.
///
/// Selects the instruction template; the state machine is the same for all.
///
/// # Example
///
/// ```
/// use ralph::r#loop::state::LoopKind;
///
/// assert_eq!(LoopKind::TestCoverage.to_string(), "test-coverage");
/// ```
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopKind {
    /// Work through the PRD task list
    #[default]
    Default,
    /// Raise test coverage
    TestCoverage,
    /// Fix lint findings
    Linting,
    /// Remove duplicated code
    Duplication,
    /// Reduce code entropy
    Entropy,
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopKind::Default => write!(f, "default"),
            LoopKind::TestCoverage => write!(f, "test-coverage"),
            LoopKind::Linting => write!(f, "linting"),
            LoopKind::Duplication => write!(f, "duplication"),
            LoopKind::Entropy => write!(f, "entropy"),
        }
    }
}

/// Status carried by a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Running => write!(f, "running"),
            LoopStatus::Paused => write!(f, "paused"),
            LoopStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted loop record for one target.
///
/// A paused record means "resume starting at `iteration`".
///
/// # Example
///
/// ```
/// use ralph::r#loop::state::{LoopKind, LoopState};
///
/// let state = LoopState::paused(4, 10, LoopKind::Default);
/// assert!(state.is_resumable());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// Next iteration to run (1-indexed)
    pub iteration: u32,
    /// Planned number of iterations
    pub total_iterations: u32,
    pub loop_kind: LoopKind,
    pub status: LoopStatus,
    #[serde(default)]
    pub current_task_id: String,
    #[serde(default)]
    pub current_task: String,
    /// RFC 3339 timestamp of the save
    pub saved_at: String,
    /// Target the record belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

impl LoopState {
    /// A paused record resuming at `iteration`.
    #[must_use]
    pub fn paused(iteration: u32, total_iterations: u32, loop_kind: LoopKind) -> Self {
        Self {
            iteration,
            total_iterations,
            loop_kind,
            status: LoopStatus::Paused,
            current_task_id: String::new(),
            current_task: String::new(),
            saved_at: Utc::now().to_rfc3339(),
            target: None,
        }
    }

    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>, task: impl Into<String>) -> Self {
        self.current_task_id = task_id.into();
        self.current_task = task.into();
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Whether a run can pick up from this record.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.status == LoopStatus::Paused
            && self.iteration >= 1
            && self.iteration <= self.total_iterations
    }

    /// Whether the numeric fields make sense at all.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.iteration >= 1 && self.total_iterations >= 1
    }
}
