//! Loop management module.
//!
//! - [`controller`] - State machine over iterations, with pause, stop,
//!   rotation, and resume
//! - [`state`] - Persisted loop record and loop kinds
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │ LoopController │────>│ IterationExecutor │────>│ EngineClient │
//! │                │     │                   │     │              │
//! └────────────────┘     └───────────────────┘     └──────────────┘
//!         │                        │                      │
//!         v                        v                      v
//! ┌────────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │  StateStore    │     │  ControlSignals   │     │ SandboxPolicy│
//! └────────────────┘     └───────────────────┘     └──────────────┘
//! ```

pub mod controller;
pub mod state;

pub use controller::{decide, LoopController, LoopExit, LoopPlan, LoopReport, LoopTransition};
pub use state::{LoopKind, LoopState, LoopStatus};
