//! Testing infrastructure for Ralph.
//!
//! This module provides test doubles for the collaborators of the iteration
//! executor and loop controller, so the state machine can be exercised
//! without a real agent engine or terminal.
//!
//! - [`MockEngine`]: scripted sessions, turn by turn, with latch injection
//!   and transport failures
//! - [`RecordingObserver`]: captures every observer callback
//! - [`ScriptedOperator`]: canned intervention replies and question answers
//! - [`MemoryStateStore`]: in-memory resumable state
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph::testing::{MockEngine, TurnScript};
//!
//! let engine = MockEngine::new()
//!     .with_turn(TurnScript::new().text("<promise>COMPLETE</promise>").succeed());
//! ```

pub mod mocks;

pub use mocks::*;
