//! Atomic file-based loop state storage.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::StateStore;
use crate::config::RalphPaths;
use crate::error::{RalphError, Result};
use crate::r#loop::state::LoopState;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Loop state stored as one JSON file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    /// Path of the record itself.
    path: PathBuf,
}

impl FileStateStore {
    /// Store at an explicit file path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store for `target` under the Ralph root.
    #[must_use]
    pub fn for_target(paths: &RalphPaths, target: &Path) -> Self {
        Self::new(paths.state_file(target))
    }

    /// Returns the path to the state file.
    #[must_use]
    pub fn state_file_path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the temporary state file.
    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// Checks if a state file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn discard(&self, reason: &str) {
        warn!(
            "Discarding loop state at {}: {}. Starting fresh.",
            self.path.display(),
            reason
        );
        let _ = fs::remove_file(&self.path);
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &LoopState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| RalphError::state(format!("Failed to acquire state lock: {e}")))?;

        let tmp_path = self.tmp_file_path();
        let json = serde_json::to_string_pretty(state)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        debug!(
            iteration = state.iteration,
            total = state.total_iterations,
            "Saved loop state to {}",
            self.path.display()
        );

        Ok(())
    }

    fn load(&self) -> Result<Option<LoopState>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = String::new();
        if let Err(e) = file.read_to_string(&mut contents) {
            self.discard(&e.to_string());
            return Ok(None);
        }
        drop(file);

        let state: LoopState = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                self.discard(&e.to_string());
                return Ok(None);
            }
        };

        if !state.is_well_formed() {
            self.discard(&format!(
                "iteration {} of {} is not valid",
                state.iteration, state.total_iterations
            ));
            return Ok(None);
        }

        Ok(Some(state))
    }

    fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Cleared loop state at {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r#loop::state::{LoopKind, LoopStatus};
    use tempfile::TempDir;

    fn test_store() -> (FileStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStateStore::new(temp_dir.path().join("state").join("abc.json"));
        (store, temp_dir)
    }

    #[test]
    fn test_load_returns_none_when_missing() {
        let (store, _temp_dir) = test_store();
        assert!(store.load().expect("load should not error").is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (store, _temp_dir) = test_store();
        let state = LoopState::paused(4, 10, LoopKind::TestCoverage)
            .with_task("T-2", "Cover the parser")
            .with_target("/work/app");

        store.save(&state).expect("save should succeed");
        let loaded = store.load().expect("load").expect("state present");
        assert_eq!(loaded, state);
        assert_eq!(loaded.status, LoopStatus::Paused);
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp_file() {
        let (store, _temp_dir) = test_store();
        store
            .save(&LoopState::paused(1, 2, LoopKind::Default))
            .expect("save");
        assert!(store.exists());
        assert!(!store.tmp_file_path().exists());
        assert!(store.lock_file_path().exists());
    }

    #[test]
    fn test_save_overwrites() {
        let (store, _temp_dir) = test_store();
        store.save(&LoopState::paused(2, 10, LoopKind::Default)).expect("save");
        store.save(&LoopState::paused(7, 10, LoopKind::Default)).expect("save");
        assert_eq!(store.load().expect("load").expect("state").iteration, 7);
    }

    #[test]
    fn test_corrupted_file_is_deleted() {
        let (store, _temp_dir) = test_store();
        fs::create_dir_all(store.state_file_path().parent().expect("parent")).expect("mkdir");
        fs::write(store.state_file_path(), "{ not valid json").expect("write");

        assert!(store.load().expect("load").is_none());
        assert!(!store.exists());
    }

    #[test]
    fn test_zero_iteration_is_treated_as_absent() {
        let (store, _temp_dir) = test_store();
        store.save(&LoopState::paused(0, 10, LoopKind::Default)).expect("save");
        assert!(store.load().expect("load").is_none());
        assert!(!store.exists());
    }

    #[test]
    fn test_clear_reports_existence() {
        let (store, _temp_dir) = test_store();
        assert!(!store.clear().expect("clear"));
        store.save(&LoopState::paused(3, 5, LoopKind::Default)).expect("save");
        assert!(store.clear().expect("clear"));
        assert!(!store.exists());
    }

    #[test]
    fn test_for_target_uses_state_dir() {
        let home = TempDir::new().expect("tempdir");
        let target = TempDir::new().expect("tempdir");
        let paths = RalphPaths::new(home.path());
        let store = FileStateStore::for_target(&paths, target.path());
        assert!(store.state_file_path().starts_with(paths.state_dir()));
        assert!(store
            .tmp_file_path()
            .to_string_lossy()
            .ends_with(".json.tmp"));
    }
}
