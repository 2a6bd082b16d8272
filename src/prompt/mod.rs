//! Instruction generation.
//!
//! - [`templates`] - Built-in templates, override files, placeholders
//!
//! The loop sends the same instruction every iteration; the agent finds its
//! bearings through the workspace files the instruction points at. Those
//! files live in the Ralph workspace, never in the target project, so every
//! instruction spells out absolute paths for both.
//!
//! # Example
//!
//! ```
//! use ralph::prompt::{PromptBuilder, templates::PromptTemplates};
//! use ralph::r#loop::state::LoopKind;
//!
//! let builder = PromptBuilder::new(PromptTemplates::with_defaults(), "/ws", "/code");
//! let prompt = builder.loop_prompt(LoopKind::Default);
//! assert!(prompt.starts_with("@/ws/PRD.json @/ws/progress.txt"));
//! ```

pub mod templates;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::RalphPaths;
use crate::r#loop::state::LoopKind;
use crate::tasks::PRD_FILE;
use templates::{template_name, Placeholder, PromptTemplates, Template};

pub const PROGRESS_FILE: &str = "progress.txt";
pub const FAILURES_FILE: &str = "failures.md";
pub const SPEC_SESSION_FILE: &str = "spec-session.md";

/// Where spec discovery starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecSource {
    #[default]
    NewProject,
    ExistingCode,
    RequirementsFile,
}

/// Inputs to the spec discovery instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecRequest {
    pub topic: String,
    pub source: SpecSource,
}

impl SpecRequest {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            source: SpecSource::default(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: SpecSource) -> Self {
        self.source = source;
        self
    }
}

/// Builds instructions for one workspace/target pair.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: PromptTemplates,
    workspace: PathBuf,
    target: PathBuf,
}

impl PromptBuilder {
    #[must_use]
    pub fn new(
        templates: PromptTemplates,
        workspace: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            templates,
            workspace: workspace.into(),
            target: target.into(),
        }
    }

    /// Builder using the overrides in `<root>/prompts/`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override file exists but cannot be read.
    pub fn load(paths: &RalphPaths, workspace: &Path, target: &Path) -> Result<Self> {
        let templates = PromptTemplates::load_or_defaults(paths.prompts_dir())?;
        Ok(Self::new(templates, workspace, target))
    }

    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn file(&self, name: &str) -> String {
        self.workspace.join(name).display().to_string()
    }

    fn path_substitutions(&self) -> HashMap<Placeholder, String> {
        HashMap::from([
            (Placeholder::PrdPath, self.file(PRD_FILE)),
            (Placeholder::ProgressPath, self.file(PROGRESS_FILE)),
            (Placeholder::FailuresPath, self.file(FAILURES_FILE)),
        ])
    }

    /// Instruction for every iteration of a `kind` loop.
    #[must_use]
    pub fn loop_prompt(&self, kind: LoopKind) -> String {
        self.with_locations(self.templates.resolve(template_name(kind)))
    }

    /// Instruction for a single iteration.
    #[must_use]
    pub fn once_prompt(&self) -> String {
        self.with_locations(self.templates.resolve("once"))
    }

    fn with_locations(&self, template: Template) -> String {
        let body = template.substitute_all(&self.path_substitutions());
        let prd = self.file(PRD_FILE);
        let progress = self.file(PROGRESS_FILE);
        format!(
            "@{prd} @{progress}\n\n{}\n\n{}",
            self.locations_section(),
            body.content()
        )
    }

    fn locations_section(&self) -> String {
        format!(
            "## File Locations (use these exact paths)\n\n\
             - **Ralph workspace**: {workspace}\n\
             \x20 - PRD: {prd}\n\
             \x20 - Progress: {progress}\n\
             \x20 - Failures: {failures}\n\
             - **Target project**: {target}\n\
             \x20 - Make code changes here only\n\
             \x20 - Never create PRD.json, progress.txt, or other Ralph files here\n\n\
             Never use relative paths like \"PRD.json\"; always use the full paths above.",
            workspace = self.workspace.display(),
            prd = self.file(PRD_FILE),
            progress = self.file(PROGRESS_FILE),
            failures = self.file(FAILURES_FILE),
            target = self.target.display(),
        )
    }

    /// Instruction for spec discovery.
    #[must_use]
    pub fn spec_prompt(&self, request: &SpecRequest) -> String {
        let context_name = match request.source {
            SpecSource::NewProject => "spec_context_new",
            SpecSource::ExistingCode => "spec_context_existing",
            SpecSource::RequirementsFile => "spec_context_file",
        };
        let prd = self.file(PRD_FILE);
        let session = self.file(SPEC_SESSION_FILE);

        let restrictions = format!(
            "**Write restrictions**: the target project is read-only during spec discovery.\n\
             - You can read files in the target project to understand context\n\
             - You can only write to the Ralph workspace: {workspace}\n\
             - Keep notes in {session}\n\
             - Write the final task list to {prd}",
            workspace = self.workspace.display(),
        );
        let context = [
            format!("**Topic**: {}", request.topic),
            self.templates.resolve(context_name).content().to_string(),
            restrictions,
        ]
        .join("\n\n");

        let body = self
            .templates
            .resolve("spec")
            .substitute(Placeholder::ContextSection, &context)
            .replace_text("generate PRD.json", &format!("generate {prd}"))
            .replace_text("Write PRD.json", &format!("Write {prd}"));

        format!("@{session}\n\n{}", body.content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(PromptTemplates::with_defaults(), "/ws/app/default", "/code/app")
    }

    #[test]
    fn test_loop_prompt_uses_workspace_paths() {
        let prompt = builder().loop_prompt(LoopKind::Default);
        assert!(prompt.starts_with("@/ws/app/default/PRD.json @/ws/app/default/progress.txt\n\n"));
        assert!(prompt.contains("Read /ws/app/default/PRD.json and pick"));
        assert!(prompt.contains("/ws/app/default/failures.md"));
        assert!(prompt.contains("**Target project**: /code/app"));
        assert!(!prompt.contains("{prd_path}"));
    }

    #[test]
    fn test_loop_kind_selects_template() {
        let prompt = builder().loop_prompt(LoopKind::Linting);
        assert!(prompt.contains("Linting"));
        assert!(!builder().loop_prompt(LoopKind::Entropy).contains("Linting"));
    }

    #[test]
    fn test_once_prompt() {
        let prompt = builder().once_prompt();
        assert!(prompt.contains("Single Iteration"));
        assert!(prompt.contains("/ws/app/default/progress.txt"));
    }

    #[test]
    fn test_spec_prompt_points_at_workspace() {
        let request = SpecRequest::new("a todo CLI").with_source(SpecSource::ExistingCode);
        let prompt = builder().spec_prompt(&request);
        assert!(prompt.starts_with("@/ws/app/default/spec-session.md\n\n"));
        assert!(prompt.contains("**Topic**: a todo CLI"));
        assert!(prompt.contains("existing codebase"));
        assert!(prompt.contains("generate /ws/app/default/PRD.json"));
        assert!(prompt.contains("Write /ws/app/default/PRD.json only once"));
        assert!(prompt.contains("<promise>SPEC_COMPLETE</promise>"));
        assert!(!prompt.contains("{context_section}"));
    }

    #[test]
    fn test_load_uses_override_dir() {
        let home = TempDir::new().expect("tempdir");
        let paths = RalphPaths::new(home.path());
        std::fs::create_dir_all(paths.prompts_dir()).expect("mkdir");
        std::fs::write(paths.prompts_dir().join("loop.md"), "Custom {progress_path}").expect("write");

        let builder = PromptBuilder::load(&paths, Path::new("/ws"), Path::new("/code")).expect("load");
        assert!(builder
            .loop_prompt(LoopKind::Default)
            .ends_with("Custom /ws/progress.txt"));
    }
}
