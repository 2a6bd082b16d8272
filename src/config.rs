//! Configuration management for Ralph.
//!
//! Global settings live in `settings.json` under the Ralph root
//! (`$RALPH_HOME`, or `~/.ralph`). Every field has a default, so a missing
//! or partial file is fine. A malformed file is reported and ignored.
//!
//! [`RalphPaths`] owns the on-disk layout:
//!
//! ```text
//! <root>/
//! ├── settings.json
//! ├── state/<key>.json              resumable loop state, one per target
//! ├── workspaces/<target>/<project>/ spec notes, PRD.json, raw_output.log
//! └── prompts/                       instruction template overrides
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{RalphError, Result};

/// Environment variable overriding the Ralph root directory.
pub const RALPH_HOME_ENV: &str = "RALPH_HOME";

/// Settings file name under the Ralph root.
pub const SETTINGS_FILE: &str = "settings.json";

/// Project name used when none is given.
pub const DEFAULT_PROJECT: &str = "default";

fn default_spec_model() -> String {
    "claude-opus-4-5-20251101".to_string()
}

fn default_loop_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_context_limit() -> u64 {
    200_000
}

fn default_rotate_threshold() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    20
}

/// Global Ralph settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RalphConfig {
    /// Model used for spec discovery.
    #[serde(default = "default_spec_model")]
    pub spec_model: String,

    /// Model used for loop iterations.
    #[serde(default = "default_loop_model")]
    pub loop_model: String,

    /// Context window size in tokens.
    #[serde(default = "default_context_limit")]
    pub context_limit: u64,

    /// Fraction of the context window that triggers a fresh session.
    #[serde(default = "default_rotate_threshold")]
    pub rotate_threshold: f64,

    /// Rotate automatically when the threshold is crossed.
    #[serde(default = "default_true")]
    pub auto_gutter: bool,

    /// Default iteration count for `ralph run`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Extra tool-server configuration handed to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<PathBuf>,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            spec_model: default_spec_model(),
            loop_model: default_loop_model(),
            context_limit: default_context_limit(),
            rotate_threshold: default_rotate_threshold(),
            auto_gutter: true,
            max_iterations: default_max_iterations(),
            mcp_config: None,
        }
    }
}

impl RalphConfig {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. A file that cannot be parsed is
    /// reported with a warning and also yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(RalphError::config_with_path(
                    format!("Failed to read settings: {e}"),
                    path.to_path_buf(),
                ))
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    "Ignoring malformed settings at {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Parse settings strictly, without falling back to defaults.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| RalphError::config(e.to_string()))
    }

    /// Write settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<()> {
        if self.context_limit == 0 {
            return Err(RalphError::invalid_config(
                "context_limit",
                "must be greater than zero",
            ));
        }
        if !(self.rotate_threshold > 0.0 && self.rotate_threshold <= 1.0) {
            return Err(RalphError::invalid_config(
                "rotate_threshold",
                format!("must be in (0, 1], got {}", self.rotate_threshold),
            ));
        }
        if self.max_iterations == 0 {
            return Err(RalphError::invalid_config(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if self.spec_model.trim().is_empty() {
            return Err(RalphError::invalid_config("spec_model", "must not be empty"));
        }
        if self.loop_model.trim().is_empty() {
            return Err(RalphError::invalid_config("loop_model", "must not be empty"));
        }
        Ok(())
    }
}

/// On-disk layout rooted at the Ralph home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RalphPaths {
    root: PathBuf,
}

impl RalphPaths {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from `$RALPH_HOME`, falling back to `~/.ralph`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(RALPH_HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        dirs::home_dir()
            .map(|home| Self::new(home.join(".ralph")))
            .ok_or_else(|| RalphError::config("Could not determine home directory; set RALPH_HOME"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[must_use]
    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    #[must_use]
    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    /// Load settings from this root.
    pub fn load_config(&self) -> Result<RalphConfig> {
        RalphConfig::load(&self.settings_file())
    }

    /// Path of the persisted loop state for `target`.
    #[must_use]
    pub fn state_file(&self, target: &Path) -> PathBuf {
        self.state_dir().join(format!("{}.json", state_key(target)))
    }

    /// Workspace directory for `target` and `project`, without creating it.
    #[must_use]
    pub fn workspace_dir(&self, target: &Path, project: Option<&str>) -> PathBuf {
        let project = project
            .map(sanitize_project_name)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        self.workspaces_dir().join(target_name(target)).join(project)
    }

    /// Workspace directory for `target` and `project`, created if missing.
    pub fn ensure_workspace(&self, target: &Path, project: Option<&str>) -> Result<PathBuf> {
        let dir = self.workspace_dir(target, project);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Canonical form of `target`, or its absolute form if it does not exist.
#[must_use]
pub fn canonical_target(target: &Path) -> PathBuf {
    fs::canonicalize(target).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(target))
            .unwrap_or_else(|_| target.to_path_buf())
    })
}

/// Stable key for `target`: first 16 hex chars of SHA-256 of its canonical path.
#[must_use]
pub fn state_key(target: &Path) -> String {
    let canonical = canonical_target(target);
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn target_name(target: &Path) -> String {
    canonical_target(target)
        .file_name()
        .map(|n| sanitize_project_name(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "root".to_string())
}

/// Replace everything outside `[A-Za-z0-9_-]` with `_`.
///
/// # Example
///
/// ```
/// use ralph::config::sanitize_project_name;
///
/// assert_eq!(sanitize_project_name("my app/v2"), "my_app_v2");
/// ```
#[must_use]
pub fn sanitize_project_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RalphConfig::default();
        assert_eq!(config.spec_model, "claude-opus-4-5-20251101");
        assert_eq!(config.loop_model, "claude-sonnet-4-5-20250929");
        assert_eq!(config.context_limit, 200_000);
        assert!((config.rotate_threshold - 0.8).abs() < f64::EPSILON);
        assert!(config.auto_gutter);
        assert_eq!(config.max_iterations, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = RalphConfig::load(&dir.path().join("settings.json")).expect("load");
        assert_eq!(config, RalphConfig::default());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"context_limit": 100000, "auto_gutter": false}"#).expect("write");

        let config = RalphConfig::load(&path).expect("load");
        assert_eq!(config.context_limit, 100_000);
        assert!(!config.auto_gutter);
        assert_eq!(config.max_iterations, 20);
    }

    #[test]
    fn test_load_malformed_file_gives_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").expect("write");
        assert_eq!(RalphConfig::load(&path).expect("load"), RalphConfig::default());
        assert!(RalphConfig::parse("{not json").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RalphConfig::default();
        config.rotate_threshold = 0.0;
        assert!(config.validate().is_err());
        config.rotate_threshold = 1.0;
        assert!(config.validate().is_ok());
        config.rotate_threshold = 1.5;
        assert!(config.validate().is_err());

        let config = RalphConfig {
            context_limit: 0,
            ..RalphConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RalphError::InvalidConfig { ref field, .. }) if field == "context_limit"
        ));

        let config = RalphConfig {
            loop_model: "  ".into(),
            ..RalphConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let config = RalphConfig {
            max_iterations: 7,
            mcp_config: Some(PathBuf::from("/tmp/mcp.json")),
            ..RalphConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(RalphConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn test_state_key_is_stable_and_short() {
        let dir = TempDir::new().expect("tempdir");
        let key = state_key(dir.path());
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, state_key(&dir.path().join(".")));
    }

    #[test]
    fn test_layout() {
        let home = TempDir::new().expect("tempdir");
        let target = TempDir::new().expect("tempdir");
        let paths = RalphPaths::new(home.path());

        assert_eq!(paths.settings_file(), home.path().join("settings.json"));
        assert!(paths.state_file(target.path()).starts_with(home.path().join("state")));

        let ws = paths.ensure_workspace(target.path(), Some("feature x")).expect("ws");
        assert!(ws.is_dir());
        assert!(ws.ends_with("feature_x"));

        let default_ws = paths.workspace_dir(target.path(), None);
        assert!(default_ws.ends_with(DEFAULT_PROJECT));
    }
}
