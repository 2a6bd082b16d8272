//! Ralph - supervised autonomous coding loops
//!
//! Command-line front end: resolves the target and workspace, wires the
//! engine, display, and keyboard listener together, and maps the run's
//! ending to an exit status.

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use ralph::config::{canonical_target, RalphConfig, RalphPaths};
use ralph::engine::ClaudeCliEngine;
use ralph::executor::{ExecutorConfig, IterationExecutor};
use ralph::keyboard::with_keyboard;
use ralph::observer::{IterationObserver, ObserverSet, RawLog, TerminalDisplay};
use ralph::operator::TerminalOperator;
use ralph::prompt::{PromptBuilder, SpecRequest, SpecSource};
use ralph::r#loop::{LoopController, LoopExit, LoopKind, LoopPlan, LoopReport, LoopState};
use ralph::sandbox::{AccessMode, SandboxPolicy};
use ralph::session::{FileStateStore, StateStore};
use ralph::signals::ControlSignals;
use ralph::tasks::PrdTasks;
use ralph::RalphError;

#[derive(Parser)]
#[command(name = "ralph")]
#[command(version)]
#[command(about = "Supervised autonomous coding loops with pause, resume, and sandboxing", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coding loop against a target project
    Run {
        /// Target project (defaults to current directory)
        #[arg(default_value = ".")]
        target: PathBuf,

        /// Number of iterations (defaults to max_iterations from settings)
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Loop kind
        #[arg(short = 't', long = "type", value_enum, default_value = "default")]
        kind: LoopKind,

        /// Resume a paused or failed run
        #[arg(short, long)]
        resume: bool,

        /// Run a single iteration
        #[arg(long, conflicts_with = "resume")]
        once: bool,

        /// Named project within the workspace
        #[arg(long)]
        project: Option<String>,

        /// Override the loop model
        #[arg(long)]
        model: Option<String>,

        /// Disable keyboard controls
        #[arg(long)]
        no_keys: bool,
    },

    /// Discover requirements interactively and write the task list
    Spec {
        /// Target project (defaults to current directory)
        #[arg(default_value = ".")]
        target: PathBuf,

        /// What to specify
        #[arg(long, default_value = "the next piece of work")]
        topic: String,

        /// The target already contains code worth exploring first
        #[arg(long, conflicts_with = "requirements")]
        existing: bool,

        /// Requirements document to start from
        #[arg(long, value_name = "FILE")]
        requirements: Option<PathBuf>,

        /// Maximum spec iterations
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Named project within the workspace
        #[arg(long)]
        project: Option<String>,

        /// Override the spec model
        #[arg(long)]
        model: Option<String>,
    },

    /// Show the saved loop state for a target
    Status {
        #[arg(default_value = ".")]
        target: PathBuf,
    },

    /// Delete the saved loop state for a target
    Clear {
        #[arg(default_value = ".")]
        target: PathBuf,
    },

    /// Inspect settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Print the settings file path
    Path,
    /// Check the settings file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "ralph=debug,info"
    } else {
        "ralph=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let code = e.downcast_ref::<RalphError>().map_or(1, RalphError::exit_code);
            std::process::exit(code);
        }
    }
}

async fn dispatch(command: Commands) -> anyhow::Result<i32> {
    let paths = RalphPaths::from_env()?;

    match command {
        Commands::Run {
            target,
            iterations,
            kind,
            resume,
            once,
            project,
            model,
            no_keys,
        } => {
            let options = RunOptions {
                iterations,
                kind,
                resume,
                once,
                project,
                model,
                keys: !no_keys,
            };
            run_loop(&paths, &target, options).await
        }
        Commands::Spec {
            target,
            topic,
            existing,
            requirements,
            iterations,
            project,
            model,
        } => {
            let source = if existing {
                SpecSource::ExistingCode
            } else if requirements.is_some() {
                SpecSource::RequirementsFile
            } else {
                SpecSource::NewProject
            };
            let options = SpecOptions {
                request: SpecRequest::new(topic).with_source(source),
                requirements,
                iterations,
                project,
                model,
            };
            run_spec(&paths, &target, options).await
        }
        Commands::Status { target } => show_status(&paths, &target),
        Commands::Clear { target } => clear_state(&paths, &target),
        Commands::Config { action } => config_command(&paths, action),
    }
}

struct RunOptions {
    iterations: Option<u32>,
    kind: LoopKind,
    resume: bool,
    once: bool,
    project: Option<String>,
    model: Option<String>,
    keys: bool,
}

struct SpecOptions {
    request: SpecRequest,
    requirements: Option<PathBuf>,
    iterations: Option<u32>,
    project: Option<String>,
    model: Option<String>,
}

fn resolve_target(target: &Path) -> anyhow::Result<PathBuf> {
    let target = canonical_target(target);
    if !target.is_dir() {
        return Err(RalphError::MissingFile { path: target }.into());
    }
    Ok(target)
}

fn load_config(paths: &RalphPaths) -> anyhow::Result<RalphConfig> {
    let config = paths.load_config()?;
    config.validate()?;
    Ok(config)
}

/// Fail early with a clear message instead of once per iteration.
fn check_engine() -> anyhow::Result<()> {
    ClaudeCliEngine::new().locate().map_err(RalphError::from)?;
    Ok(())
}

fn info(message: &str) {
    println!("{} {}", "→".cyan(), message);
}

fn confirm(question: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        return false;
    }
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Where a loop starts: fresh at 1, or at a saved record.
fn starting_point(store: &dyn StateStore, resume: bool, target: &Path) -> Option<LoopState> {
    let saved = match store.load() {
        Ok(saved) => saved.filter(LoopState::is_resumable),
        Err(e) => {
            tracing::warn!("Could not read loop state: {e}");
            None
        }
    };
    let state = saved?;

    if resume {
        return Some(state);
    }
    let question = format!(
        "Found a paused run for {} at iteration {}/{}. Resume it?",
        target.display(),
        state.iteration,
        state.total_iterations
    );
    confirm(&question).then_some(state)
}

struct Session {
    signals: ControlSignals,
    operator: Arc<TerminalOperator>,
    display: Arc<TerminalDisplay>,
    observers: Arc<dyn IterationObserver>,
}

impl Session {
    fn new(workspace: &Path) -> Self {
        let signals = ControlSignals::new();
        let display = Arc::new(TerminalDisplay::new());
        let observers = ObserverSet::new()
            .with(display.clone())
            .with(Arc::new(RawLog::in_workspace(workspace)));
        Self {
            operator: Arc::new(TerminalOperator::new(signals.clone())),
            signals,
            display,
            observers: Arc::new(observers),
        }
    }

    fn executor(&self, config: ExecutorConfig) -> IterationExecutor {
        IterationExecutor::new(
            Arc::new(ClaudeCliEngine::new()),
            self.signals.clone(),
            self.operator.clone(),
            Arc::clone(&self.observers),
            config,
        )
    }
}

async fn run_loop(paths: &RalphPaths, target: &Path, options: RunOptions) -> anyhow::Result<i32> {
    let target = resolve_target(target)?;
    let config = load_config(paths)?;
    check_engine()?;

    let workspace = paths
        .ensure_workspace(&target, options.project.as_deref())
        .context("Failed to create workspace")?;
    let store = Arc::new(FileStateStore::for_target(paths, &target));
    let prompts = PromptBuilder::load(paths, &workspace, &target)?;
    let policy = Arc::new(
        SandboxPolicy::project(&target)?.with_root(&workspace, AccessMode::ReadWrite)?,
    );

    let mut executor_config = ExecutorConfig::loop_from(&config);
    if let Some(model) = options.model {
        executor_config = executor_config.with_model(model);
    }

    let session = Session::new(&workspace);
    let controller = LoopController::new(session.executor(executor_config), store.clone())
        .with_tasks(Arc::new(PrdTasks::in_workspace(&workspace)));

    info(&format!("Target:    {}", target.display()));
    info(&format!("Workspace: {}", workspace.display()));
    if options.keys && std::io::stdin().is_terminal() {
        session.display.print_controls();
    }

    let report = if options.once {
        let instruction = prompts.once_prompt();
        with_keyboard(
            &session.signals,
            options.keys,
            controller.run_once(&instruction, policy),
        )
        .await
    } else {
        let plan = match starting_point(store.as_ref(), options.resume, &target) {
            Some(saved) => {
                info(&format!(
                    "Resuming at iteration {}/{}",
                    saved.iteration, saved.total_iterations
                ));
                LoopPlan::new(
                    prompts.loop_prompt(saved.loop_kind),
                    policy,
                    saved.total_iterations,
                )
                .starting_at(saved.iteration)
                .with_kind(saved.loop_kind)
            }
            None => {
                if options.resume {
                    info("Nothing to resume, starting fresh");
                }
                let total = options.iterations.unwrap_or(config.max_iterations);
                LoopPlan::new(prompts.loop_prompt(options.kind), policy, total)
                    .with_kind(options.kind)
            }
        }
        .with_target(&target);

        with_keyboard(&session.signals, options.keys, controller.run(&plan)).await?
    };

    session.display.print_summary();
    report_exit(&report, &target);
    Ok(report.exit_code())
}

fn report_exit(report: &LoopReport, target: &Path) {
    let line = format!(
        "{} after {} iteration(s): {}",
        report.exit,
        report.iterations_run,
        report.exit.description()
    );
    match report.exit {
        LoopExit::Completed => println!("{} {}", "✓".green().bold(), line.green()),
        LoopExit::Errored | LoopExit::GutterStuck => println!("{} {}", "✗".red().bold(), line.red()),
        LoopExit::Paused | LoopExit::Stopped | LoopExit::Exhausted => {
            println!("{} {}", "■".yellow().bold(), line.yellow());
        }
    }
    if report.exit.is_resumable() {
        info(&format!("Resume with: ralph run {} --resume", target.display()));
    }
    if report.exit == LoopExit::Errored {
        if let Some(outcome) = &report.last_outcome {
            match &outcome.error {
                Some(err) => eprintln!("  {}", err.to_string().dimmed()),
                None => eprintln!("  {}", outcome.result_text.dimmed()),
            }
        }
    }
}

async fn run_spec(paths: &RalphPaths, target: &Path, options: SpecOptions) -> anyhow::Result<i32> {
    let target = resolve_target(target)?;
    let config = load_config(paths)?;
    check_engine()?;

    let workspace = paths
        .ensure_workspace(&target, options.project.as_deref())
        .context("Failed to create workspace")?;

    let mut request = options.request;
    if let Some(file) = &options.requirements {
        let copy = workspace.join("requirements.md");
        std::fs::copy(file, &copy)
            .with_context(|| format!("Failed to copy requirements from {}", file.display()))?;
        request.topic = format!("{} (requirements: {})", request.topic, copy.display());
    }

    let prompts = PromptBuilder::load(paths, &workspace, &target)?;
    let session = Session::new(&workspace);
    let policy = Arc::new(
        SandboxPolicy::spec(&target, &workspace)?.with_question_handler(session.operator.clone()),
    );

    let mut executor_config = ExecutorConfig::spec_from(&config);
    if let Some(model) = options.model {
        executor_config = executor_config.with_model(model);
    }
    let store = Arc::new(FileStateStore::for_target(paths, &target));
    let controller = LoopController::new(session.executor(executor_config), store);

    info(&format!("Spec discovery for {}", target.display()));
    info(&format!("Writing to {}", workspace.display()));

    let max = options.iterations.unwrap_or(config.max_iterations);
    let instruction = prompts.spec_prompt(&request);
    let report = with_keyboard(
        &session.signals,
        true,
        controller.run_spec(&instruction, policy, max),
    )
    .await?;

    session.display.print_summary();
    if report.exit == LoopExit::Completed {
        println!(
            "{} Spec complete. Start the loop with: ralph run {}",
            "✓".green().bold(),
            target.display()
        );
    } else {
        println!("{} Spec discovery {}", "■".yellow().bold(), report.exit);
    }
    Ok(report.exit_code())
}

fn show_status(paths: &RalphPaths, target: &Path) -> anyhow::Result<i32> {
    let target = canonical_target(target);
    let store = FileStateStore::for_target(paths, &target);

    match store.load()? {
        Some(state) => {
            println!("{}", "Saved loop state".cyan().bold());
            println!("  Target:     {}", target.display());
            println!("  Status:     {}", state.status);
            println!(
                "  Iteration:  {}/{}",
                state.iteration, state.total_iterations
            );
            println!("  Loop type:  {}", state.loop_kind);
            if !state.current_task.is_empty() {
                println!("  Task:       {} {}", state.current_task_id, state.current_task);
            }
            println!("  Saved at:   {}", state.saved_at);
            if state.is_resumable() {
                println!();
                info(&format!("Resume with: ralph run {} --resume", target.display()));
            }
        }
        None => println!("No saved loop state for {}", target.display()),
    }
    Ok(0)
}

fn clear_state(paths: &RalphPaths, target: &Path) -> anyhow::Result<i32> {
    let target = canonical_target(target);
    let store = FileStateStore::for_target(paths, &target);
    if store.clear()? {
        println!("{} Cleared loop state for {}", "✓".green(), target.display());
    } else {
        println!("No saved loop state for {}", target.display());
    }
    Ok(0)
}

fn config_command(paths: &RalphPaths, action: ConfigAction) -> anyhow::Result<i32> {
    match action {
        ConfigAction::Show => {
            let config = paths.load_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Path => println!("{}", paths.settings_file().display()),
        ConfigAction::Validate => {
            let file = paths.settings_file();
            let config = match std::fs::read_to_string(&file) {
                Ok(content) => RalphConfig::parse(&content)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => RalphConfig::default(),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", file.display()))
                }
            };
            config.validate()?;
            println!("{} Settings are valid", "✓".green());
        }
    }
    Ok(0)
}
