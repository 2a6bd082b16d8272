//! Resumable loop state.
//!
//! The loop controller reads one [`LoopState`] record per target when a run
//! starts and writes it when a run pauses or fails. A record is removed when
//! a run stops, completes, or starts over at iteration 1.
//!
//! # Persistence
//!
//! [`FileStateStore`] keeps the record at `<root>/state/<key>.json`:
//! - Atomic writes prevent corruption on crash
//! - A lock file serialises writers
//! - Corrupted records are handled gracefully (deleted with warning)
//!
//! Absence of a record means there is nothing to resume.

pub mod persistence;

use crate::error::Result;
use crate::r#loop::state::LoopState;

pub use persistence::FileStateStore;

/// Storage for the single resumable record of one target.
pub trait StateStore: Send + Sync {
    /// Read the record, treating anything unusable as absent.
    fn load(&self) -> Result<Option<LoopState>>;

    /// Replace the record.
    fn save(&self, state: &LoopState) -> Result<()>;

    /// Remove the record. Returns whether one existed.
    fn clear(&self) -> Result<bool>;
}
