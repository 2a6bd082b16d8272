//! Ralph - supervised autonomous coding loops
//!
//! Drives an external coding agent through repeated iterations toward a
//! goal, confines every file it touches to declared directories, and lets a
//! human pause, stop, rotate, or redirect it while it works. Paused and
//! failed runs resume at the right iteration.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`] - Settings and the on-disk layout under the Ralph root
//! - [`engine`] - Agent engine interface and the `claude` CLI adapter
//! - [`error`] - Custom error types and handling
//! - [`executor`] - One iteration: events in, outcome out
//! - [`keyboard`] - Raw-key control listener
//! - [`r#loop`] - Loop controller state machine and persisted loop state
//! - [`observer`] - Progress display and raw output log
//! - [`operator`] - Human input during a run
//! - [`prompt`] - Instruction templates
//! - [`sandbox`] - Tool permission policy
//! - [`session`] - Resumable state storage
//! - [`signals`] - Operator control latches
//! - [`tasks`] - Current task lookup
//! - [`testing`] - Testing infrastructure (mocks for every collaborator)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ralph::engine::ClaudeCliEngine;
//! use ralph::executor::{ExecutorConfig, IterationExecutor};
//! use ralph::r#loop::{LoopController, LoopPlan};
//! use ralph::sandbox::SandboxPolicy;
//! use ralph::session::FileStateStore;
//!
//! let executor = IterationExecutor::new(
//!     Arc::new(ClaudeCliEngine::new()),
//!     signals.clone(),
//!     operator,
//!     observer,
//!     ExecutorConfig::loop_from(&config),
//! );
//! let controller = LoopController::new(executor, Arc::new(FileStateStore::for_target(&paths, &target)));
//! let plan = LoopPlan::new(instruction, Arc::new(SandboxPolicy::project(&target)?), 20);
//! let report = controller.run(&plan).await?;
//! std::process::exit(report.exit_code());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod keyboard;
pub mod r#loop;
pub mod observer;
pub mod operator;
pub mod prompt;
pub mod sandbox;
pub mod session;
pub mod signals;
pub mod tasks;
pub mod testing;

// Re-export commonly used types
pub use error::{RalphError, Result};

pub use config::{RalphConfig, RalphPaths};
pub use engine::{ClaudeCliEngine, EngineClient, EngineError, EngineEvent, EngineSession};
pub use executor::{IterationExecutor, IterationOutcome};
pub use r#loop::{LoopController, LoopExit, LoopKind, LoopPlan, LoopReport, LoopState};
pub use sandbox::{SandboxPolicy, ToolGate};
pub use session::{FileStateStore, StateStore};
pub use signals::{ControlSignals, Signal};
