//! Engine adapter for the `claude` CLI.
//!
//! The CLI runs as a child process speaking newline-delimited JSON on stdin
//! and stdout (`--input-format stream-json --output-format stream-json`).
//! Tool permission checks arrive as `control_request` messages on the same
//! channel (`--permission-prompt-tool stdio`) and are answered by the
//! session's [`ToolGate`] before the tool runs.
//!
//! Parsing and message construction are plain functions over
//! [`serde_json::Value`] so they can be tested without a process.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    EngineClient, EngineError, EngineEvent, EngineSession, ResultRecord, SessionOptions, Usage,
};
use crate::sandbox::{PermissionDecision, ToolGate};

/// Executable looked up on `PATH`.
pub const CLI_NAME: &str = "claude";

/// How long `close` waits for the process before killing it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long end-of-stream waits for an exit status.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Spawns one `claude` process per session.
#[derive(Debug, Clone, Default)]
pub struct ClaudeCliEngine {
    program: Option<PathBuf>,
}

impl ClaudeCliEngine {
    /// Engine that finds `claude` on `PATH` when a session opens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine using an explicit executable.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    /// Resolve the executable.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CliNotFound`] if `claude` is not on `PATH`.
    pub fn locate(&self) -> Result<PathBuf, EngineError> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        which::which(CLI_NAME).map_err(|e| EngineError::CliNotFound {
            message: format!("{CLI_NAME}: {e}"),
        })
    }
}

/// Command-line arguments for a session.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ralph::engine::claude::build_args;
/// use ralph::engine::{PermissionMode, SessionOptions};
/// use ralph::sandbox::SandboxPolicy;
///
/// let dir = std::env::temp_dir();
/// let policy = Arc::new(SandboxPolicy::read_only(&dir).unwrap());
/// let options = SessionOptions {
///     model: "m".into(),
///     cwd: dir,
///     permission_mode: PermissionMode::Plan,
///     allowed_tools: vec!["Read".into(), "Grep".into()],
///     tool_gate: policy,
///     mcp_config: None,
/// };
/// let args = build_args(&options);
/// assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Grep"]));
/// ```
#[must_use]
pub fn build_args(options: &SessionOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "-p",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--model",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();

    args.push(options.model.clone());
    args.push("--permission-mode".to_string());
    args.push(options.permission_mode.as_str().to_string());
    args.push("--allowedTools".to_string());
    args.push(options.allowed_tools.join(","));
    args.push("--permission-prompt-tool".to_string());
    args.push("stdio".to_string());

    if let Some(mcp) = &options.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(mcp.display().to_string());
    }
    args
}

/// A decoded line from the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Zero or more stream events.
    Events(Vec<EngineEvent>),
    /// The CLI asks whether a tool may run.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    /// Anything the session does not act on.
    Ignored,
}

/// Decode one stdout line.
///
/// # Errors
///
/// Returns [`EngineError::Protocol`] if the line is not a JSON object.
pub fn parse_line(line: &str) -> Result<Inbound, EngineError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| EngineError::protocol(format!("invalid JSON from engine: {e}")))?;
    if !value.is_object() {
        return Err(EngineError::protocol("engine message is not an object"));
    }

    let inbound = match value["type"].as_str().unwrap_or_default() {
        "assistant" => Inbound::Events(assistant_events(&value)),
        "user" => Inbound::Events(tool_results(&value)),
        "result" => Inbound::Events(vec![EngineEvent::Result(result_record(&value))]),
        "control_request" => {
            let request = &value["request"];
            if request["subtype"].as_str() == Some("can_use_tool") {
                Inbound::PermissionRequest {
                    request_id: value["request_id"].as_str().unwrap_or_default().to_string(),
                    tool_name: request["tool_name"].as_str().unwrap_or_default().to_string(),
                    input: request.get("input").cloned().unwrap_or_else(|| json!({})),
                }
            } else {
                Inbound::Ignored
            }
        }
        _ => Inbound::Ignored,
    };
    Ok(inbound)
}

fn content_blocks(value: &Value) -> &[Value] {
    value["message"]["content"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn assistant_events(value: &Value) -> Vec<EngineEvent> {
    content_blocks(value)
        .iter()
        .filter_map(|block| match block["type"].as_str()? {
            "text" => Some(EngineEvent::AssistantText(
                block["text"].as_str()?.to_string(),
            )),
            "thinking" => Some(EngineEvent::Thinking(
                block["thinking"].as_str()?.to_string(),
            )),
            "tool_use" => Some(EngineEvent::ToolUse {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str()?.to_string(),
                input: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => None,
        })
        .collect()
}

fn tool_results(value: &Value) -> Vec<EngineEvent> {
    content_blocks(value)
        .iter()
        .filter(|block| block["type"].as_str() == Some("tool_result"))
        .map(|block| EngineEvent::ToolResult {
            id: block["tool_use_id"].as_str().unwrap_or_default().to_string(),
            content: tool_result_text(&block["content"]),
        })
        .collect()
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn result_record(value: &Value) -> ResultRecord {
    let usage = &value["usage"];
    let tokens = |key: &str| usage[key].as_u64().unwrap_or(0);
    let is_error = value["is_error"].as_bool().unwrap_or(false);

    ResultRecord {
        success: value["subtype"].as_str() == Some("success") && !is_error,
        duration_ms: value["duration_ms"].as_u64().unwrap_or(0),
        num_turns: value["num_turns"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        usage: Usage {
            input_tokens: tokens("input_tokens"),
            cache_read_tokens: tokens("cache_read_input_tokens"),
            cache_creation_tokens: tokens("cache_creation_input_tokens"),
            output_tokens: tokens("output_tokens"),
        },
        cost_usd: value["total_cost_usd"].as_f64().unwrap_or(0.0),
        result_text: value["result"].as_str().map(str::to_string),
    }
}

/// A user turn.
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
}

/// Reply to a `can_use_tool` request.
///
/// An allow without a rewritten input echoes the original input.
#[must_use]
pub fn permission_response(request_id: &str, decision: &PermissionDecision, input: &Value) -> Value {
    let body = match decision {
        PermissionDecision::Allow { updated_input } => json!({
            "behavior": "allow",
            "updatedInput": updated_input.as_ref().unwrap_or(input),
        }),
        PermissionDecision::Deny { message } => json!({
            "behavior": "deny",
            "message": message,
        }),
    };
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": body,
        },
    })
}

/// A control request of `subtype`.
#[must_use]
pub fn control_request(request_id: &str, subtype: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": subtype },
    })
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

#[async_trait]
impl EngineClient for ClaudeCliEngine {
    async fn open(&self, options: SessionOptions) -> Result<Box<dyn EngineSession>, EngineError> {
        let program = self.locate()?;
        let args = build_args(&options);
        debug!(program = %program.display(), ?args, "Spawning engine");

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                message: format!("{}: {e}", program.display()),
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn {
                message: "engine stdout unavailable".to_string(),
            })?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        let mut session = ClaudeSession {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            gate: options.tool_gate,
            stderr_tail,
            interrupted: 0,
            closed: false,
        };
        session
            .write(&control_request(&new_request_id(), "initialize"))
            .await?;
        info!("Engine session opened");
        Ok(Box::new(session))
    }
}

struct ClaudeSession {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<EngineEvent>,
    gate: Arc<dyn ToolGate>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    /// Results still owed by interrupted turns.
    interrupted: u32,
    closed: bool,
}

impl ClaudeSession {
    async fn write(&mut self, message: &Value) -> Result<(), EngineError> {
        let stdin = self.stdin.as_mut().ok_or(EngineError::NotConnected)?;
        let mut line = message.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn answer_permission(
        &mut self,
        request_id: &str,
        tool_name: String,
        input: Value,
    ) -> Result<(), EngineError> {
        let gate = Arc::clone(&self.gate);
        let checked = input.clone();
        let name = tool_name.clone();
        let decision = tokio::task::spawn_blocking(move || gate.check(&name, &checked))
            .await
            .unwrap_or_else(|e| PermissionDecision::deny(format!("permission check failed: {e}")));

        if let PermissionDecision::Deny { message } = &decision {
            debug!(tool = %tool_name, "Denied tool call: {message}");
        }
        self.write(&permission_response(request_id, &decision, &input))
            .await
    }

    fn queue(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            if matches!(event, EngineEvent::Result(_)) && self.interrupted > 0 {
                self.interrupted -= 1;
                debug!("Dropping result of interrupted turn");
                continue;
            }
            self.pending.push_back(event);
        }
    }

    fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Stdout closed: report how the process ended.
    async fn ended(&mut self) -> Result<Option<EngineEvent>, EngineError> {
        match tokio::time::timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) if !status.success() => Err(EngineError::Exited {
                code: status.code().unwrap_or(-1),
                stderr: self.stderr_tail(),
            }),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl EngineSession for ClaudeSession {
    async fn send(&mut self, text: &str) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        self.write(&user_message(text)).await
    }

    async fn next_event(&mut self) -> Result<Option<EngineEvent>, EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(line) = self.lines.next_line().await? else {
                return self.ended().await;
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(&line) {
                Ok(Inbound::Events(events)) => self.queue(events),
                Ok(Inbound::PermissionRequest {
                    request_id,
                    tool_name,
                    input,
                }) => {
                    self.answer_permission(&request_id, tool_name, input)
                        .await?;
                }
                Ok(Inbound::Ignored) => {}
                Err(e) => warn!("Skipping engine output: {e}"),
            }
        }
    }

    async fn interrupt(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        self.write(&control_request(&new_request_id(), "interrupt"))
            .await?;
        // A buffered result already belongs to the interrupted turn.
        let buffered = self.pending.len();
        self.pending.retain(|e| !matches!(e, EngineEvent::Result(_)));
        if self.pending.len() == buffered {
            self.interrupted += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        drop(self.stdin.take());

        match tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Engine exited with {status}");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Engine did not exit within {CLOSE_TIMEOUT:?}, killing it");
                self.child.kill().await.map_err(EngineError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PermissionMode;
    use crate::sandbox::SandboxPolicy;
    use tempfile::TempDir;

    fn options(dir: &TempDir, mcp: Option<PathBuf>) -> SessionOptions {
        SessionOptions {
            model: "claude-sonnet-4-5-20250929".into(),
            cwd: dir.path().to_path_buf(),
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: vec!["Read".into(), "Write".into()],
            tool_gate: Arc::new(SandboxPolicy::project(dir.path()).expect("policy")),
            mcp_config: mcp,
        }
    }

    #[test]
    fn test_build_args() {
        let dir = TempDir::new().expect("tempdir");
        let args = build_args(&options(&dir, None));
        assert_eq!(
            args,
            vec![
                "-p",
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "claude-sonnet-4-5-20250929",
                "--permission-mode",
                "acceptEdits",
                "--allowedTools",
                "Read,Write",
                "--permission-prompt-tool",
                "stdio",
            ]
        );
    }

    #[test]
    fn test_build_args_with_mcp_config() {
        let dir = TempDir::new().expect("tempdir");
        let args = build_args(&options(&dir, Some(PathBuf::from("/etc/mcp.json"))));
        assert_eq!(&args[args.len() - 2..], ["--mcp-config", "/etc/mcp.json"]);
    }

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Hello"},
            {"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"a.rs"}},
            {"type":"image"}
        ]}}"#
            .replace('\n', "");
        let Inbound::Events(events) = parse_line(&line).expect("parse") else {
            panic!("expected events");
        };
        assert_eq!(
            events,
            vec![
                EngineEvent::Thinking("hmm".into()),
                EngineEvent::AssistantText("Hello".into()),
                EngineEvent::ToolUse {
                    id: "toolu_1".into(),
                    name: "Read".into(),
                    input: json!({"file_path": "a.rs"}),
                },
            ]
        );
    }

    #[test]
    fn test_parse_tool_results() {
        let line = r#"{"type":"user","message":{"content":[
            {"type":"tool_result","tool_use_id":"toolu_1","content":"plain"},
            {"type":"tool_result","tool_use_id":"toolu_2","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}
        ]}}"#
            .replace('\n', "");
        let Inbound::Events(events) = parse_line(&line).expect("parse") else {
            panic!("expected events");
        };
        assert_eq!(
            events,
            vec![
                EngineEvent::ToolResult {
                    id: "toolu_1".into(),
                    content: "plain".into()
                },
                EngineEvent::ToolResult {
                    id: "toolu_2".into(),
                    content: "a\nb".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_result_record() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,
            "num_turns":4,"result":"done <promise>COMPLETE</promise>","total_cost_usd":0.42,
            "usage":{"input_tokens":10,"cache_read_input_tokens":150000,"cache_creation_input_tokens":20000,"output_tokens":900}}"#
            .replace('\n', "");
        let Inbound::Events(events) = parse_line(&line).expect("parse") else {
            panic!("expected events");
        };
        let EngineEvent::Result(record) = &events[0] else {
            panic!("expected result");
        };
        assert!(record.success);
        assert_eq!(record.duration_ms, 1200);
        assert_eq!(record.num_turns, 4);
        assert_eq!(record.usage.context_tokens(), 170_010);
        assert_eq!(record.usage.output_tokens, 900);
        assert!((record.cost_usd - 0.42).abs() < f64::EPSILON);
        assert_eq!(
            record.result_text.as_deref(),
            Some("done <promise>COMPLETE</promise>")
        );
    }

    #[test]
    fn test_parse_error_result_is_failure() {
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true}"#;
        let Inbound::Events(events) = parse_line(line).expect("parse") else {
            panic!("expected events");
        };
        assert!(matches!(&events[0], EngineEvent::Result(r) if !r.success && r.result_text.is_none()));
    }

    #[test]
    fn test_parse_permission_request() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"file_path":"x"}}}"#;
        assert_eq!(
            parse_line(line).expect("parse"),
            Inbound::PermissionRequest {
                request_id: "r1".into(),
                tool_name: "Write".into(),
                input: json!({"file_path": "x"}),
            }
        );
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert_eq!(
            parse_line(r#"{"type":"system","subtype":"init"}"#).expect("parse"),
            Inbound::Ignored
        );
        assert_eq!(
            parse_line(r#"{"type":"control_response","response":{}}"#).expect("parse"),
            Inbound::Ignored
        );
        assert_eq!(
            parse_line(r#"{"type":"control_request","request_id":"r","request":{"subtype":"hook_callback"}}"#)
                .expect("parse"),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_line("warning: something"),
            Err(EngineError::Protocol { .. })
        ));
        assert!(parse_line("[1,2]").is_err());
    }

    #[test]
    fn test_user_message_shape() {
        assert_eq!(
            user_message("go"),
            json!({"type":"user","message":{"role":"user","content":"go"}})
        );
    }

    #[test]
    fn test_permission_response_allow_echoes_input() {
        let input = json!({"file_path": "a"});
        let response = permission_response("r1", &PermissionDecision::allow(), &input);
        assert_eq!(response["response"]["request_id"], "r1");
        assert_eq!(response["response"]["response"]["behavior"], "allow");
        assert_eq!(response["response"]["response"]["updatedInput"], input);
    }

    #[test]
    fn test_permission_response_allow_with_rewrite() {
        let rewritten = json!({"file_path": "/w/notes.md"});
        let response = permission_response(
            "r2",
            &PermissionDecision::allow_with(rewritten.clone()),
            &json!({"file_path": "notes.md"}),
        );
        assert_eq!(response["response"]["response"]["updatedInput"], rewritten);
    }

    #[test]
    fn test_permission_response_deny() {
        let response = permission_response("r3", &PermissionDecision::deny("outside root"), &json!({}));
        assert_eq!(response["type"], "control_response");
        assert_eq!(response["response"]["response"]["behavior"], "deny");
        assert_eq!(response["response"]["response"]["message"], "outside root");
    }

    #[test]
    fn test_control_request_shape() {
        let request = control_request("req_1", "interrupt");
        assert_eq!(request["type"], "control_request");
        assert_eq!(request["request"]["subtype"], "interrupt");
        assert!(new_request_id().starts_with("req_"));
    }

    #[test]
    fn test_explicit_program_skips_lookup() {
        let engine = ClaudeCliEngine::with_program("/opt/claude");
        assert_eq!(engine.locate().expect("locate"), PathBuf::from("/opt/claude"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let dir = TempDir::new().expect("tempdir");
        let engine = ClaudeCliEngine::with_program(dir.path().join("no-such-claude"));
        let err = engine.open(options(&dir, None)).await.err().expect("spawn error");
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
