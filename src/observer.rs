//! Iteration observers.
//!
//! The executor and controller report everything they see to an
//! [`IterationObserver`]. Observers never influence control flow; they
//! render progress, accumulate statistics, and keep logs.
//!
//! - [`TerminalDisplay`] prints a colored activity log and run totals.
//! - [`RawLog`] appends unabridged agent output to `raw_output.log`.
//! - [`ObserverSet`] fans events out to several observers.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use colored::Colorize;
use serde_json::Value;
use tracing::debug;

use crate::engine::ResultRecord;
use crate::executor::IterationOutcome;
use crate::keyboard;

/// Receives iteration progress. All methods default to doing nothing.
pub trait IterationObserver: Send + Sync {
    fn on_iteration_start(&self, _iteration: u32, _total: u32) {}

    fn on_task(&self, _task_id: &str, _description: &str) {}

    fn on_assistant_text(&self, _text: &str) {}

    fn on_thinking(&self, _text: &str) {}

    fn on_tool_use(&self, _name: &str, _input: &Value) {}

    fn on_tool_result(&self, _id: &str, _content: &str) {}

    fn on_result(&self, _record: &ResultRecord) {}

    fn on_intervention(&self, _text: &str) {}

    fn on_iteration_end(&self, _iteration: u32, _outcome: &IterationOutcome) {}

    /// Loop-level notices such as rotation or pause.
    fn on_status(&self, _message: &str) {}
}

/// Fans events out to every registered observer, in order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn IterationObserver>>,
}

impl ObserverSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, observer: Arc<dyn IterationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn IterationObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl IterationObserver for ObserverSet {
    fn on_iteration_start(&self, iteration: u32, total: u32) {
        self.observers
            .iter()
            .for_each(|o| o.on_iteration_start(iteration, total));
    }

    fn on_task(&self, task_id: &str, description: &str) {
        self.observers.iter().for_each(|o| o.on_task(task_id, description));
    }

    fn on_assistant_text(&self, text: &str) {
        self.observers.iter().for_each(|o| o.on_assistant_text(text));
    }

    fn on_thinking(&self, text: &str) {
        self.observers.iter().for_each(|o| o.on_thinking(text));
    }

    fn on_tool_use(&self, name: &str, input: &Value) {
        self.observers.iter().for_each(|o| o.on_tool_use(name, input));
    }

    fn on_tool_result(&self, id: &str, content: &str) {
        self.observers.iter().for_each(|o| o.on_tool_result(id, content));
    }

    fn on_result(&self, record: &ResultRecord) {
        self.observers.iter().for_each(|o| o.on_result(record));
    }

    fn on_intervention(&self, text: &str) {
        self.observers.iter().for_each(|o| o.on_intervention(text));
    }

    fn on_iteration_end(&self, iteration: u32, outcome: &IterationOutcome) {
        self.observers
            .iter()
            .for_each(|o| o.on_iteration_end(iteration, outcome));
    }

    fn on_status(&self, message: &str) {
        self.observers.iter().for_each(|o| o.on_status(message));
    }
}

/// Cumulative totals across a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub iterations: u32,
    pub rotations: u32,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl RunStats {
    /// Fold one iteration's outcome into the totals.
    pub fn record(&mut self, outcome: &IterationOutcome) {
        self.iterations += 1;
        if outcome.is_auto_gutter || outcome.is_user_gutter {
            self.rotations += 1;
        }
        self.input_tokens += outcome.input_tokens;
        self.output_tokens += outcome.output_tokens;
        self.cost_usd += outcome.cost_usd;
        self.duration_ms += outcome.duration_ms;
    }

    /// Human-readable summary block.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Iterations:     {}\nRotations:      {}\nTool calls:     {}\nTotal tokens:   {} in / {} out\nTotal cost:     ${:.2}\nTotal duration: {:.1}s",
            self.iterations,
            self.rotations,
            self.tool_calls,
            self.input_tokens,
            self.output_tokens,
            self.cost_usd,
            self.duration_ms as f64 / 1000.0
        )
    }
}

fn one_line(text: &str, max: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&cleaned, max)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn truncate_path(path: &str, max: usize) -> String {
    if path.chars().count() <= max {
        return path.to_string();
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() >= 2 {
        let suffix = parts[parts.len() - 2..].join("/");
        if suffix.chars().count() + 4 <= max {
            return format!(".../{suffix}");
        }
    }
    let tail: String = path
        .chars()
        .rev()
        .take(max.saturating_sub(3))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Short description of a tool call for the activity log.
#[must_use]
pub fn describe_tool_input(name: &str, input: &Value) -> String {
    const MAX: usize = 60;
    let field = |key| str_field(input, key);
    match name {
        "Read" | "Write" | "Edit" | "MultiEdit" => truncate_path(field("file_path"), MAX),
        "Bash" => one_line(field("command"), MAX),
        "Glob" => truncate(field("pattern"), MAX),
        "Grep" => format!("\"{}\"", truncate(field("pattern"), MAX - 2)),
        "TodoWrite" => "(updating task list)".to_string(),
        _ => String::new(),
    }
}

/// Colored line-oriented progress display.
#[derive(Debug)]
pub struct TerminalDisplay {
    stats: Mutex<RunStats>,
}

impl Default for TerminalDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalDisplay {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(RunStats::default()),
        }
    }

    /// Snapshot of the accumulated totals.
    #[must_use]
    pub fn stats(&self) -> RunStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn emit(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{line}{}", keyboard::line_ending());
        let _ = out.flush();
    }

    /// Print the key hints shown at the start of a run.
    pub fn print_controls(&self) {
        self.emit(&format!(
            "{} pause  {} new context  {} stop  {} intervene",
            "[p]".cyan().bold(),
            "[g]".yellow().bold(),
            "[s]".red().bold(),
            "[i]".magenta().bold()
        ));
    }

    /// Print the run totals.
    pub fn print_summary(&self) {
        self.emit("");
        self.emit(&"Run Summary".cyan().bold().to_string());
        for line in self.stats().summary().lines() {
            self.emit(&format!("  {line}"));
        }
    }
}

impl IterationObserver for TerminalDisplay {
    fn on_iteration_start(&self, iteration: u32, total: u32) {
        self.emit("");
        self.emit(
            &format!("━━━ Iteration {iteration}/{total} ━━━")
                .cyan()
                .bold()
                .to_string(),
        );
    }

    fn on_task(&self, task_id: &str, description: &str) {
        if task_id.is_empty() {
            self.emit(&format!("{} {}", "Task:".bold(), one_line(description, 100)));
        } else {
            self.emit(&format!(
                "{} {} {}",
                "Task:".bold(),
                format!("[{task_id}]").yellow().bold(),
                one_line(description, 100)
            ));
        }
    }

    fn on_assistant_text(&self, text: &str) {
        let line = one_line(text, 150);
        if !line.is_empty() {
            self.emit(&format!("{} {}", "●".white(), line));
        }
    }

    fn on_thinking(&self, text: &str) {
        let line = one_line(text, 120);
        if !line.is_empty() {
            self.emit(&format!("{} {}", "∴".dimmed(), line.dimmed()));
        }
    }

    fn on_tool_use(&self, name: &str, input: &Value) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.tool_calls += 1;
        }
        let detail = describe_tool_input(name, input);
        self.emit(&format!("{} {} {}", "→".blue(), name.blue().bold(), detail.dimmed()));
    }

    fn on_intervention(&self, text: &str) {
        self.emit(&format!("{} {}", "Operator:".magenta().bold(), one_line(text, 150)));
    }

    fn on_iteration_end(&self, iteration: u32, outcome: &IterationOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(outcome);
        }
        let status = if outcome.success {
            "ok".green().bold()
        } else {
            "failed".red().bold()
        };
        self.emit(&format!(
            "Iteration {iteration} {status}: {} in / {} out, ${:.2}, {:.1}s, {} turns",
            outcome.input_tokens,
            outcome.output_tokens,
            outcome.cost_usd,
            outcome.duration_ms as f64 / 1000.0,
            outcome.num_turns
        ));
        if !outcome.success {
            self.emit(&format!("  {}", one_line(&outcome.result_text, 200).red()));
        }
    }

    fn on_status(&self, message: &str) {
        self.emit(&message.yellow().bold().to_string());
    }
}

/// Appends raw agent output to a log file.
///
/// Write failures are logged at debug level and otherwise ignored.
#[derive(Debug)]
pub struct RawLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RawLog {
    /// Log file name inside a workspace.
    pub const FILE_NAME: &'static str = "raw_output.log";

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Log at `<workspace>/raw_output.log`.
    #[must_use]
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(Self::FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `[HH:MM:SS] [PREFIX] message` line.
    pub fn write(&self, prefix: &str, message: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    debug!("Cannot open raw log {}: {e}", self.path.display());
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let timestamp = Local::now().format("%H:%M:%S");
            let line = if prefix.is_empty() {
                format!("[{timestamp}] {message}\n")
            } else {
                format!("[{timestamp}] [{prefix}] {message}\n")
            };
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
                debug!("Raw log write failed: {e}");
            }
        }
    }
}

impl IterationObserver for RawLog {
    fn on_iteration_start(&self, iteration: u32, total: u32) {
        self.write("ITERATION", &format!("{iteration}/{total}"));
    }

    fn on_task(&self, task_id: &str, description: &str) {
        self.write("TASK", &format!("{task_id} {description}").trim().to_string());
    }

    fn on_assistant_text(&self, text: &str) {
        self.write("TEXT", text);
    }

    fn on_thinking(&self, text: &str) {
        self.write("THINKING", text);
    }

    fn on_tool_use(&self, name: &str, input: &Value) {
        let input = serde_json::to_string_pretty(input).unwrap_or_default();
        self.write("TOOL_USE", &format!("{name}: {input}"));
    }

    fn on_tool_result(&self, id: &str, content: &str) {
        self.write("TOOL_RESULT", &format!("[{id}] {content}"));
    }

    fn on_result(&self, record: &ResultRecord) {
        self.write(
            "RESULT",
            &format!(
                "success={} turns={} tokens_in={} tokens_out={} cost=${:.4} duration={}ms",
                record.success,
                record.num_turns,
                record.usage.context_tokens(),
                record.usage.output_tokens,
                record.cost_usd,
                record.duration_ms
            ),
        );
    }

    fn on_intervention(&self, text: &str) {
        self.write("INTERVENTION", text);
    }

    fn on_status(&self, message: &str) {
        self.write("STATUS", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Counter(AtomicU32);

    impl IterationObserver for Counter {
        fn on_assistant_text(&self, _text: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observer_set_fans_out() {
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let set = ObserverSet::new().with(a.clone()).with(b.clone());
        set.on_assistant_text("hello");
        set.on_thinking("ignored by counters");
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_run_stats_record_and_summary() {
        let mut stats = RunStats::default();
        let outcome = IterationOutcome {
            success: true,
            is_auto_gutter: true,
            is_gutter: true,
            input_tokens: 170_000,
            output_tokens: 2_000,
            cost_usd: 1.25,
            duration_ms: 1_500,
            ..IterationOutcome::default()
        };
        stats.record(&outcome);
        stats.record(&IterationOutcome::default());
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.rotations, 1);
        assert_eq!(stats.input_tokens, 170_000);

        let summary = stats.summary();
        assert!(summary.contains("170000 in / 2000 out"));
        assert!(summary.contains("$1.25"));
        assert!(summary.contains("1.5s"));
    }

    #[test]
    fn test_describe_tool_input() {
        assert_eq!(
            describe_tool_input("Bash", &json!({"command": "cargo   test\n--all"})),
            "cargo test --all"
        );
        assert_eq!(describe_tool_input("Grep", &json!({"pattern": "fn main"})), "\"fn main\"");
        let long = format!("/very/long/{}/src/lib.rs", "x".repeat(80));
        assert_eq!(describe_tool_input("Read", &json!({"file_path": long})), ".../src/lib.rs");
        assert_eq!(describe_tool_input("Unknown", &json!({})), "");
    }

    #[test]
    fn test_raw_log_format() {
        let dir = TempDir::new().expect("tempdir");
        let log = RawLog::in_workspace(dir.path());
        log.on_assistant_text("hello world");
        log.on_tool_result("toolu_1", "ok");

        let content = std::fs::read_to_string(dir.path().join(RawLog::FILE_NAME)).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[TEXT] hello world"));
        assert!(lines[1].ends_with("[TOOL_RESULT] [toolu_1] ok"));
    }

    #[test]
    fn test_raw_log_unwritable_path_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let log = RawLog::new(dir.path().join("missing").join("raw.log"));
        log.write("TEXT", "dropped");
        assert!(!log.path().exists());
    }

    #[test]
    fn test_terminal_display_counts_tools() {
        let display = TerminalDisplay::new();
        display.on_tool_use("Read", &json!({"file_path": "a.rs"}));
        display.on_iteration_end(1, &IterationOutcome::default());
        let stats = display.stats();
        assert_eq!(stats.tool_calls, 1);
        assert_eq!(stats.iterations, 1);
    }
}
