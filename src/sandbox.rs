//! Capability sandbox for agent file access.
//!
//! Every file-touching tool call the agent attempts is routed through a
//! [`ToolGate`] before it executes. [`SandboxPolicy`] is the production gate:
//! it resolves the tool's path argument to an absolute, symlink-free form and
//! only allows the call when that path lies inside one of the declared
//! [`SandboxRoot`]s with a sufficient [`AccessMode`].
//!
//! Three phases are supported:
//!
//! - [`ToolPhase::Project`]: normal coding iterations. File tools are confined
//!   to the project root; non-file tools are allowed.
//! - [`ToolPhase::ReadOnly`]: only read/search tools, confined to the root.
//! - [`ToolPhase::Spec`]: spec discovery. Reads may touch the target or the
//!   workspace, writes only the workspace, and relative write paths are
//!   rewritten to land in the workspace.
//!
//! Denials are never errors. They are returned as [`PermissionDecision::Deny`]
//! with a reason the agent can read and adapt to.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::PermissionMode;
use crate::error::Result;

/// Name of the structured user-question tool.
pub const ASK_USER_QUESTION: &str = "AskUserQuestion";

const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "NotebookRead"];
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// What a sandbox root permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub const fn allows_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub const fn allows_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// A directory boundary enforced by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    path: PathBuf,
    mode: AccessMode,
}

impl SandboxRoot {
    /// Create a root, canonicalizing the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or cannot be resolved.
    pub fn new(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = fs::canonicalize(path.as_ref())?;
        Ok(Self { path, mode })
    }

    /// Canonical path of the root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn contains(&self, resolved: &Path) -> bool {
        resolved.starts_with(&self.path)
    }
}

/// Tool capability set for an operating phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPhase {
    /// Full coding tool set.
    Project,
    /// Read and search only.
    ReadOnly,
    /// Spec discovery: read anywhere allowed, write to the workspace.
    Spec,
}

impl ToolPhase {
    /// Tools offered to the engine in this phase.
    #[must_use]
    pub fn tools(&self) -> &'static [&'static str] {
        match self {
            Self::Project => &[
                "Read",
                "Write",
                "Edit",
                "MultiEdit",
                "Bash",
                "Glob",
                "Grep",
                "TodoWrite",
            ],
            Self::ReadOnly => &["Read", "Glob", "Grep"],
            Self::Spec => &["Read", "Glob", "Grep", "Write", "Edit"],
        }
    }

    /// Permission mode the engine runs under in this phase.
    #[must_use]
    pub fn permission_mode(&self) -> PermissionMode {
        match self {
            Self::Project | Self::Spec => PermissionMode::AcceptEdits,
            Self::ReadOnly => PermissionMode::Plan,
        }
    }

    /// Whether tools outside [`ToolPhase::tools`] are refused.
    fn restricts_tools(&self) -> bool {
        !matches!(self, Self::Project)
    }
}

impl fmt::Display for ToolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::ReadOnly => write!(f, "read-only"),
            Self::Spec => write!(f, "spec discovery"),
        }
    }
}

/// Result of a tool gate check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Let the tool run, optionally with a rewritten input.
    Allow { updated_input: Option<Value> },
    /// Refuse this call. The session continues.
    Deny { message: String },
}

impl PermissionDecision {
    #[must_use]
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    #[must_use]
    pub fn allow_with(updated_input: Value) -> Self {
        Self::Allow {
            updated_input: Some(updated_input),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Decides whether a tool call may proceed.
///
/// Called synchronously by the engine adapter before the tool executes.
pub trait ToolGate: Send + Sync {
    fn check(&self, tool_name: &str, input: &Value) -> PermissionDecision;
}

/// One option offered for a structured question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// A structured question the agent asks the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Answers the agent's structured questions.
///
/// Blocks until the operator has answered. Returns a map from question text
/// to answer.
pub trait QuestionHandler: Send + Sync {
    fn answer(&self, questions: &[Question]) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Immutable per-session sandbox configuration.
#[derive(Clone)]
pub struct SandboxPolicy {
    roots: Vec<SandboxRoot>,
    phase: ToolPhase,
    questions: Option<Arc<dyn QuestionHandler>>,
}

impl fmt::Debug for SandboxPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxPolicy")
            .field("roots", &self.roots)
            .field("phase", &self.phase)
            .field("questions", &self.questions.is_some())
            .finish()
    }
}

impl SandboxPolicy {
    /// Policy for normal coding iterations confined to `root`.
    pub fn project(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            roots: vec![SandboxRoot::new(root, AccessMode::ReadWrite)?],
            phase: ToolPhase::Project,
            questions: None,
        })
    }

    /// Policy that only permits reading and searching inside `root`.
    pub fn read_only(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            roots: vec![SandboxRoot::new(root, AccessMode::ReadOnly)?],
            phase: ToolPhase::ReadOnly,
            questions: None,
        })
    }

    /// Policy for spec discovery: `target` is read-only, `workspace` takes
    /// the writes and may also be read back.
    pub fn spec(target: impl AsRef<Path>, workspace: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            roots: vec![
                SandboxRoot::new(target, AccessMode::ReadOnly)?,
                SandboxRoot::new(workspace, AccessMode::ReadWrite)?,
            ],
            phase: ToolPhase::Spec,
            questions: None,
        })
    }

    /// Add another allowed directory.
    ///
    /// Project runs use this for the Ralph workspace, which holds the task
    /// list and progress notes the agent updates.
    pub fn with_root(mut self, root: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        self.roots.push(SandboxRoot::new(root, mode)?);
        Ok(self)
    }

    /// Attach a handler for structured operator questions.
    #[must_use]
    pub fn with_question_handler(mut self, handler: Arc<dyn QuestionHandler>) -> Self {
        self.questions = Some(handler);
        self
    }

    #[must_use]
    pub fn phase(&self) -> ToolPhase {
        self.phase
    }

    #[must_use]
    pub fn roots(&self) -> &[SandboxRoot] {
        &self.roots
    }

    /// Root the engine should run in: the first readable root.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.base_for(Access::Read).or_else(|| self.roots.first().map(SandboxRoot::path))
    }

    /// Tools offered to the engine under this policy.
    #[must_use]
    pub fn allowed_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.phase.tools().iter().map(ToString::to_string).collect();
        if self.phase == ToolPhase::Spec && self.questions.is_some() {
            tools.push(ASK_USER_QUESTION.to_string());
        }
        tools
    }

    #[must_use]
    pub fn permission_mode(&self) -> PermissionMode {
        self.phase.permission_mode()
    }

    fn base_for(&self, access: Access) -> Option<&Path> {
        self.roots
            .iter()
            .find(|r| match access {
                Access::Read => r.mode.allows_read(),
                Access::Write => r.mode.allows_write(),
            })
            .map(SandboxRoot::path)
    }

    fn permits(&self, resolved: &Path, access: Access) -> bool {
        self.roots.iter().any(|root| {
            let mode_ok = match access {
                Access::Read => root.mode.allows_read(),
                Access::Write => root.mode.allows_write(),
            };
            mode_ok && root.contains(resolved)
        })
    }

    fn check_file_tool(&self, tool_name: &str, input: &Value, access: Access) -> PermissionDecision {
        let Some(base) = self.base_for(access) else {
            return PermissionDecision::deny(format!(
                "Tool '{tool_name}' is not allowed: no directory permits this access"
            ));
        };

        let key = path_argument(tool_name);
        let raw = key
            .and_then(|k| input.get(k))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        let Some(raw) = raw else {
            if defaults_to_root(tool_name) {
                return PermissionDecision::allow();
            }
            if access == Access::Write && self.phase == ToolPhase::Spec {
                return PermissionDecision::deny("Write denied: No file path specified");
            }
            return PermissionDecision::allow();
        };

        let resolved = match resolve_path(base, Path::new(raw)) {
            Ok(p) => p,
            Err(e) => {
                warn!("Sandbox could not resolve {raw}: {e}");
                return PermissionDecision::deny(format!(
                    "Access denied: {raw} could not be resolved ({e})"
                ));
            }
        };

        if !self.permits(&resolved, access) {
            debug!(tool = tool_name, path = %resolved.display(), "Sandbox denied access");
            let message = match (self.phase, access) {
                (ToolPhase::Spec, Access::Write) => format!(
                    "Write denied: During spec discovery, files can only be written to the Ralph workspace. Target: {raw}. Allowed: {}",
                    base.display()
                ),
                (ToolPhase::Spec, Access::Read) => {
                    format!("Read access denied: {raw} is outside allowed directories")
                }
                _ => format!(
                    "Access denied: {raw} is outside project directory ({})",
                    base.display()
                ),
            };
            return PermissionDecision::deny(message);
        }

        if self.phase == ToolPhase::Spec && access == Access::Write {
            if let (Some(key), Value::Object(map)) = (key, input) {
                let mut updated = map.clone();
                updated.insert(
                    key.to_string(),
                    Value::String(resolved.to_string_lossy().into_owned()),
                );
                return PermissionDecision::allow_with(Value::Object(updated));
            }
        }

        PermissionDecision::allow()
    }

    fn answer_questions(&self, input: &Value) -> PermissionDecision {
        let Some(handler) = &self.questions else {
            return PermissionDecision::deny(format!(
                "Tool '{ASK_USER_QUESTION}' is not available: no operator is attached"
            ));
        };

        let questions: Vec<Question> = match input.get("questions") {
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(q) => q,
                Err(e) => {
                    return PermissionDecision::deny(format!("Malformed questions: {e}"));
                }
            },
            None => Vec::new(),
        };

        if questions.is_empty() {
            return PermissionDecision::allow();
        }

        let answers = handler.answer(&questions);
        let mut updated = match input {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let answers = answers
            .into_iter()
            .map(|(q, a)| (q, Value::String(a)))
            .collect::<serde_json::Map<_, _>>();
        updated.insert("answers".to_string(), Value::Object(answers));
        PermissionDecision::allow_with(Value::Object(updated))
    }
}

impl ToolGate for SandboxPolicy {
    fn check(&self, tool_name: &str, input: &Value) -> PermissionDecision {
        if tool_name == ASK_USER_QUESTION && self.phase == ToolPhase::Spec {
            return self.answer_questions(input);
        }

        if self.phase.restricts_tools() && !self.phase.tools().contains(&tool_name) {
            debug!(tool = tool_name, phase = %self.phase, "Sandbox refused tool");
            return PermissionDecision::deny(format!(
                "Tool '{tool_name}' not allowed in {} mode",
                self.phase
            ));
        }

        if READ_TOOLS.contains(&tool_name) {
            self.check_file_tool(tool_name, input, Access::Read)
        } else if WRITE_TOOLS.contains(&tool_name) {
            self.check_file_tool(tool_name, input, Access::Write)
        } else {
            PermissionDecision::allow()
        }
    }
}

/// Input field holding the target path for a file tool.
#[must_use]
pub fn path_argument(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "Read" | "Write" | "Edit" | "MultiEdit" => Some("file_path"),
        "NotebookEdit" | "NotebookRead" => Some("notebook_path"),
        "Glob" | "Grep" | "LS" => Some("path"),
        _ => None,
    }
}

/// Tools that operate on a directory and default to the root.
fn defaults_to_root(tool_name: &str) -> bool {
    matches!(tool_name, "Glob" | "Grep" | "LS")
}

/// Resolve `candidate` against `base` to an absolute path with every existing
/// symlink followed and every `..` applied.
///
/// Components that do not exist yet are appended lexically. Any other lookup
/// failure (permission denied, I/O error) and any failure to canonicalize an
/// existing component is returned as an error so callers fail closed.
pub fn resolve_path(base: &Path, candidate: &Path) -> std::io::Result<PathBuf> {
    resolve_with(base, candidate, |p| fs::symlink_metadata(p).map(|_| ()))
}

/// Whether a lookup error means the component simply does not exist yet.
fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

fn resolve_with<F>(base: &Path, candidate: &Path, lookup: F) -> std::io::Result<PathBuf>
where
    F: Fn(&Path) -> std::io::Result<()>,
{
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                match lookup(&resolved) {
                    Ok(()) => resolved = fs::canonicalize(&resolved)?,
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(resolved)
}
