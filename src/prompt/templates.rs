//! Instruction templates and placeholder substitution.
//!
//! Every template has a built-in default. A file named `<name>.md` in the
//! prompts directory replaces the default of the same name.
//!
//! # Example
//!
//! ```
//! use ralph::prompt::templates::{Placeholder, PromptTemplates};
//!
//! let templates = PromptTemplates::with_defaults();
//! let lp = templates.get_template("loop").expect("default loop template");
//! assert!(lp.has_placeholder(Placeholder::PrdPath));
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::r#loop::state::LoopKind;

/// Substitution points recognised in templates.
///
/// # Example
///
/// ```
/// use ralph::prompt::templates::Placeholder;
///
/// assert_eq!(Placeholder::ProgressPath.tag(), "{progress_path}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// Workspace task list.
    PrdPath,
    /// Workspace progress notes.
    ProgressPath,
    /// Workspace failure notes.
    FailuresPath,
    /// Spec discovery context block.
    ContextSection,
}

impl Placeholder {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Placeholder::PrdPath => "{prd_path}",
            Placeholder::ProgressPath => "{progress_path}",
            Placeholder::FailuresPath => "{failures_path}",
            Placeholder::ContextSection => "{context_section}",
        }
    }

    #[must_use]
    pub fn all() -> &'static [Placeholder] {
        &[
            Placeholder::PrdPath,
            Placeholder::ProgressPath,
            Placeholder::FailuresPath,
            Placeholder::ContextSection,
        ]
    }
}

impl std::fmt::Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// A template with the placeholders it contains.
///
/// # Example
///
/// ```
/// use ralph::prompt::templates::{Placeholder, Template};
///
/// let template = Template::new("Read {prd_path} first.");
/// let filled = template.substitute(Placeholder::PrdPath, "/w/PRD.json");
/// assert_eq!(filled.content(), "Read /w/PRD.json first.");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    content: String,
    placeholders: Vec<Placeholder>,
}

impl Template {
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let placeholders = Placeholder::all()
            .iter()
            .copied()
            .filter(|p| content.contains(p.tag()))
            .collect();
        Self {
            content,
            placeholders,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    #[must_use]
    pub fn has_placeholder(&self, placeholder: Placeholder) -> bool {
        self.placeholders.contains(&placeholder)
    }

    /// Replace every occurrence of `placeholder`.
    #[must_use]
    pub fn substitute(&self, placeholder: Placeholder, replacement: &str) -> Template {
        Template::new(self.content.replace(placeholder.tag(), replacement))
    }

    /// Replace several placeholders. Plain replacement, so JSON braces in
    /// the template survive untouched.
    #[must_use]
    pub fn substitute_all(&self, substitutions: &HashMap<Placeholder, String>) -> Template {
        let mut content = self.content.clone();
        for (placeholder, replacement) in substitutions {
            content = content.replace(placeholder.tag(), replacement);
        }
        Template::new(content)
    }

    /// Replace literal text that is not a placeholder.
    #[must_use]
    pub fn replace_text(&self, from: &str, to: &str) -> Template {
        Template::new(self.content.replace(from, to))
    }
}

/// Template name for a loop kind.
///
/// # Example
///
/// ```
/// use ralph::prompt::templates::template_name;
/// use ralph::r#loop::state::LoopKind;
///
/// assert_eq!(template_name(LoopKind::TestCoverage), "loop_test_coverage");
/// ```
#[must_use]
pub fn template_name(kind: LoopKind) -> &'static str {
    match kind {
        LoopKind::Default => "loop",
        LoopKind::TestCoverage => "loop_test_coverage",
        LoopKind::Linting => "loop_linting",
        LoopKind::Duplication => "loop_duplication",
        LoopKind::Entropy => "loop_entropy",
    }
}

/// Names with a built-in default.
pub const TEMPLATE_NAMES: &[&str] = &[
    "loop",
    "loop_test_coverage",
    "loop_linting",
    "loop_duplication",
    "loop_entropy",
    "once",
    "spec",
    "spec_context_new",
    "spec_context_existing",
    "spec_context_file",
];

/// Template collection keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplates {
    templates: HashMap<String, Template>,
}

impl PromptTemplates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in templates only.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut templates = Self::new();
        for name in TEMPLATE_NAMES {
            if let Some(content) = default_template(name) {
                templates.add_template(*name, Template::new(content));
            }
        }
        templates
    }

    /// Load `<name>.md` files from `dir`. A missing directory yields an
    /// empty collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a template file cannot be read.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut templates = Self::new();

        if !dir.exists() {
            return Ok(templates);
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".md"))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read template: {}", path.display()))?;
            debug!("Loaded prompt override {}", path.display());
            templates.add_template(name, Template::new(content.trim()));
        }

        Ok(templates)
    }

    /// Overrides from `dir`, defaults for everything else.
    ///
    /// # Errors
    ///
    /// Returns an error if override files exist but cannot be read.
    pub fn load_or_defaults(dir: impl AsRef<Path>) -> Result<Self> {
        let mut templates = Self::load_from_dir(dir)?;
        for (name, template) in Self::with_defaults().templates {
            templates.templates.entry(name).or_insert(template);
        }
        Ok(templates)
    }

    pub fn add_template(&mut self, name: impl Into<String>, template: Template) {
        self.templates.insert(name.into(), template);
    }

    #[must_use]
    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template for `name`, falling back to the built-in default, then to
    /// the default loop template.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Template {
        self.templates
            .get(name)
            .cloned()
            .or_else(|| default_template(name).map(Template::new))
            .unwrap_or_else(|| Template::new(DEFAULT_LOOP))
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn default_template(name: &str) -> Option<&'static str> {
    let content = match name {
        "loop" => DEFAULT_LOOP,
        "loop_test_coverage" => DEFAULT_LOOP_TEST_COVERAGE,
        "loop_linting" => DEFAULT_LOOP_LINTING,
        "loop_duplication" => DEFAULT_LOOP_DUPLICATION,
        "loop_entropy" => DEFAULT_LOOP_ENTROPY,
        "once" => DEFAULT_ONCE,
        "spec" => DEFAULT_SPEC,
        "spec_context_new" => DEFAULT_SPEC_CONTEXT_NEW,
        "spec_context_existing" => DEFAULT_SPEC_CONTEXT_EXISTING,
        "spec_context_file" => DEFAULT_SPEC_CONTEXT_FILE,
        _ => return None,
    };
    Some(content)
}

const DEFAULT_LOOP: &str = r#"# Ralph Loop Iteration

You are one iteration of an autonomous coding loop. Your context is fresh;
everything you know about earlier iterations is in the files below.

1. Read {prd_path} and pick the highest-priority task whose status is not "done".
2. Read {progress_path} for notes left by earlier iterations and
   {failures_path} for approaches that did not work.
3. Implement that ONE task in the target project. Keep the change small.
4. Run the project's tests and linters. Fix what you broke.
5. Mark the task "done" in {prd_path} and append a short note to {progress_path}.
   If an approach failed, record it in {failures_path}.
6. Commit your work.

When every task in {prd_path} is done, output <promise>COMPLETE</promise>.
If you are blocked and cannot make progress without a human, explain why in
{progress_path} and output <promise>GUTTER</promise>."#;

const DEFAULT_LOOP_TEST_COVERAGE: &str = r#"# Ralph Loop Iteration: Test Coverage

You are one iteration of an autonomous loop whose goal is test coverage.

1. Read {progress_path} to see which areas earlier iterations already covered.
2. Measure coverage with the project's tooling and find the least-tested
   module that matters.
3. Write meaningful tests for it. Test behaviour, not implementation details.
4. Run the full test suite; everything must pass.
5. Append the module and the coverage change to {progress_path} and commit.

When coverage is comprehensive for the code that matters, output
<promise>COMPLETE</promise>. If you are blocked, note why in {failures_path}
and output <promise>GUTTER</promise>."#;

const DEFAULT_LOOP_LINTING: &str = r#"# Ralph Loop Iteration: Linting

You are one iteration of an autonomous loop whose goal is a clean lint run.

1. Read {progress_path} for what earlier iterations fixed.
2. Run the project's linters and pick one group of related findings.
3. Fix them properly; do not silence warnings without a reason.
4. Run the tests to make sure nothing changed behaviour.
5. Append what you fixed to {progress_path} and commit.

When the linters report nothing, output <promise>COMPLETE</promise>.
If you are blocked, note why in {failures_path} and output
<promise>GUTTER</promise>."#;

const DEFAULT_LOOP_DUPLICATION: &str = r#"# Ralph Loop Iteration: Duplication

You are one iteration of an autonomous loop whose goal is removing duplicated code.

1. Read {progress_path} for what earlier iterations consolidated.
2. Find the most significant block of duplicated logic in the target project.
3. Extract it into one shared implementation and update every caller.
4. Run the tests; behaviour must not change.
5. Append what you consolidated to {progress_path} and commit.

When no meaningful duplication remains, output <promise>COMPLETE</promise>.
If you are blocked, note why in {failures_path} and output
<promise>GUTTER</promise>."#;

const DEFAULT_LOOP_ENTROPY: &str = r#"# Ralph Loop Iteration: Entropy

You are one iteration of an autonomous loop whose goal is reducing code entropy:
dead code, stale comments, inconsistent naming, and overgrown functions.

1. Read {progress_path} for what earlier iterations cleaned up.
2. Pick one area of the target project that has drifted the most.
3. Simplify it without changing behaviour.
4. Run the tests.
5. Append what you cleaned to {progress_path} and commit.

When the codebase is tidy, output <promise>COMPLETE</promise>.
If you are blocked, note why in {failures_path} and output
<promise>GUTTER</promise>."#;

const DEFAULT_ONCE: &str = r#"# Ralph Single Iteration

Read {prd_path} and {progress_path}. Pick the highest-priority task that is not
"done", implement it in the target project, run the tests, mark the task "done"
in {prd_path}, append a note to {progress_path}, and commit.

If an approach fails, record it in {failures_path}.
If every task is done, output <promise>COMPLETE</promise>."#;

const DEFAULT_SPEC: &str = r#"# Ralph Spec Discovery

You are helping a human turn an idea into a task list an autonomous coding loop
can execute.

{context_section}

## How to work

- Ask the user focused questions with the AskUserQuestion tool. One topic at a
  time; offer concrete options where you can.
- Keep running notes of what you have learned.
- When the requirements are clear, generate PRD.json with this shape:

```json
{
  "name": "project name",
  "tasks": [
    {"id": "T-1", "name": "short imperative title", "description": "what done means", "priority": 1, "status": "pending"}
  ]
}
```

Write PRD.json only once the user agrees with the plan, then output
<promise>SPEC_COMPLETE</promise>."#;

const DEFAULT_SPEC_CONTEXT_NEW: &str = r#"This is a new project. Start from the user's goals: who it is for, what it
must do first, and what can wait."#;

const DEFAULT_SPEC_CONTEXT_EXISTING: &str = r#"This is an existing codebase. Explore it first so your questions are about
the change, not about things you could read for yourself."#;

const DEFAULT_SPEC_CONTEXT_FILE: &str = r#"The user supplied a requirements file. Read it first and ask only about
gaps and ambiguities."#;
