use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use super::{AdapterError, AdapterFactory, EventSink, ProcessHandle};
use crate::runs::{RawEvent, channel, event_type};
use crate::workspace::WorkspaceRoot;

/// Kind-specific meta for `ai` sessions.
///
/// One prompt is in flight at a time; prompts written while a turn is active
/// are **enqueued** (FIFO) and dispatched as results complete. `stream`
/// controls whether partial `ai:delta` events are emitted alongside complete
/// messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiMeta {
    pub model: Option<String>,
    /// `default`, `acceptEdits`, `plan`, or `bypassPermissions`.
    pub permission_mode: Option<String>,
    pub max_turns: Option<u32>,
    pub cwd: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub stream: bool,
}

impl Default for AiMeta {
    fn default() -> Self {
        Self {
            model: None,
            permission_mode: None,
            max_turns: None,
            cwd: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            system_prompt: None,
            stream: true,
        }
    }
}

/// Command line for one persistent `claude` child. The run id doubles as the
/// upstream session id so a run maps 1:1 onto one conversation.
fn build_args(run_id: &str, meta: &AiMeta) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--session-id".to_string(),
        run_id.to_string(),
    ];

    if let Some(model) = &meta.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(max_turns) = meta.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    match meta.permission_mode.as_deref() {
        Some("bypassPermissions") => args.push("--dangerously-skip-permissions".to_string()),
        Some(mode) => {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        None => {}
    }
    if !meta.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(meta.allowed_tools.join(","));
    }
    if !meta.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(meta.disallowed_tools.join(","));
    }
    if let Some(prompt) = &meta.system_prompt {
        if !prompt.is_empty() {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
    }

    args
}

/// Translate one stream-json output line into log events. Returns the events
/// plus whether the line was a terminal `result` (ends the current turn).
fn translate_line(line: &str, stream_deltas: bool) -> (Vec<RawEvent>, bool) {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable claude output line");
            return (Vec::new(), false);
        }
    };

    let line_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match line_type {
        "content_block_delta" => {
            if !stream_deltas {
                return (Vec::new(), false);
            }
            let Some(delta) = value.get("delta") else {
                return (Vec::new(), false);
            };
            if delta.get("type").and_then(|v| v.as_str()) != Some("text_delta") {
                return (Vec::new(), false);
            }
            let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if text.is_empty() {
                return (Vec::new(), false);
            }
            (
                vec![RawEvent::json(
                    channel::AI_DELTA,
                    event_type::STREAM,
                    &json!({ "text": text }),
                )],
                false,
            )
        }
        "assistant" => {
            let message = value.get("message").cloned().unwrap_or(json!({}));
            (
                vec![RawEvent::json(
                    channel::AI_MESSAGE,
                    event_type::ASSISTANT,
                    &message,
                )],
                false,
            )
        }
        "result" => {
            let subtype = value.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
            let result_type = if subtype == "success" {
                event_type::SUCCESS
            } else {
                event_type::ERROR
            };
            let payload = json!({
                "result": value.get("result").cloned().unwrap_or(serde_json::Value::Null),
                "subtype": subtype,
                "costUsd": value.get("total_cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "turns": value.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0),
                "durationMs": value.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
                "usage": value.get("usage").cloned().unwrap_or(serde_json::Value::Null),
            });
            (
                vec![RawEvent::json(channel::AI_RESULT, result_type, &payload)],
                true,
            )
        }
        // Init banners, user-echo and tool plumbing lines don't enter the log.
        _ => (Vec::new(), false),
    }
}

enum DriverCmd {
    Prompt(String),
    Close,
}

/// Drives a streaming `claude` CLI child in stream-json mode. The child stays
/// alive across turns; prompts go in on stdin, incremental output comes back
/// as JSONL and is translated onto `ai:*` channels. Upstream failures are
/// per-turn `ai:error` events; they do not kill the session.
pub struct AiAdapter {
    workspace: WorkspaceRoot,
}

impl AiAdapter {
    pub fn new(workspace: WorkspaceRoot) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl AdapterFactory for AiAdapter {
    fn kind(&self) -> &'static str {
        "ai"
    }

    async fn open(
        &self,
        run_id: &str,
        meta: &serde_json::Value,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, AdapterError> {
        let meta: AiMeta = serde_json::from_value(meta.clone())
            .map_err(|e| AdapterError::Invalid(format!("ai meta: {e}")))?;

        let cwd = match &meta.cwd {
            Some(cwd) => self
                .workspace
                .validate(cwd)
                .map_err(|e| AdapterError::Invalid(e.to_string()))?,
            None => self.workspace.root().to_path_buf(),
        };

        let args = build_args(run_id, &meta);
        let mut child = Command::new("claude")
            .args(&args)
            .current_dir(&cwd)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::Spawn(format!("spawn claude: {e}")))?;

        let pid = child.id();
        tracing::info!(run_id = %run_id, pid, model = meta.model.as_deref().unwrap_or("default"), "ai session spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Spawn("claude stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Spawn("claude stdout not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::debug!(run_id = %run_id, stderr = %line, "claude stderr");
                    }
                }
            });
        }

        events.emit(RawEvent::status_opened());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(child, stdin, stdout, cmd_rx, events, meta.stream));

        Ok(Box::new(AiHandle {
            cmd_tx,
            closed: AtomicBool::new(false),
            pid,
        }))
    }
}

/// Single-owner driver loop: serializes turns, queues prompts that arrive
/// while one is active, and emits the terminal status event exactly once.
async fn drive(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: tokio::process::ChildStdout,
    mut cmd_rx: mpsc::UnboundedReceiver<DriverCmd>,
    events: EventSink,
    stream_deltas: bool,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut busy = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(DriverCmd::Prompt(prompt)) => {
                    queue.push_back(prompt);
                    if !busy {
                        busy = start_next(&mut stdin, &mut queue, &events).await;
                    } else {
                        tracing::debug!(run_id = %events.run_id(), queued = queue.len(), "prompt enqueued behind active turn");
                    }
                }
                Some(DriverCmd::Close) | None => {
                    if busy {
                        events.emit(RawEvent::json(
                            channel::AI_RESULT,
                            event_type::INTERRUPT,
                            &json!({}),
                        ));
                    }
                    let _ = child.start_kill();
                    let code = child.wait().await.ok().and_then(|s| s.code());
                    events.emit(RawEvent::status_closed(json!({
                        "exitCode": code,
                        "signal": serde_json::Value::Null,
                    })));
                    return;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let (translated, turn_done) = translate_line(&line, stream_deltas);
                    for event in translated {
                        events.emit(event);
                    }
                    if turn_done {
                        busy = start_next(&mut stdin, &mut queue, &events).await;
                    }
                }
                Ok(None) | Err(_) => {
                    // Upstream process died on its own.
                    let code = child.wait().await.ok().and_then(|s| s.code());
                    if busy {
                        events.emit(RawEvent::json(
                            channel::AI_ERROR,
                            event_type::EXECUTION_ERROR,
                            &json!({ "message": format!("claude exited mid-turn (exit code {code:?})") }),
                        ));
                    }
                    events.emit(RawEvent::status_closed(json!({
                        "exitCode": code,
                        "signal": serde_json::Value::Null,
                    })));
                    return;
                }
            }
        }
    }
}

/// Pop the next queued prompt onto the child's stdin. Returns whether a turn
/// is now in flight.
async fn start_next(
    stdin: &mut ChildStdin,
    queue: &mut VecDeque<String>,
    events: &EventSink,
) -> bool {
    while let Some(prompt) = queue.pop_front() {
        let msg = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        let line = format!("{msg}\n");
        match stdin.write_all(line.as_bytes()).await {
            Ok(()) => return true,
            Err(e) => {
                tracing::error!(run_id = %events.run_id(), error = %e, "failed to write prompt to claude stdin");
                events.emit(RawEvent::json(
                    channel::AI_ERROR,
                    event_type::EXECUTION_ERROR,
                    &json!({ "message": format!("stdin write failed: {e}") }),
                ));
            }
        }
    }
    false
}

struct AiHandle {
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
    closed: AtomicBool,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessHandle for AiHandle {
    fn kind(&self) -> &'static str {
        "ai"
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        let prompt = std::str::from_utf8(data)
            .map_err(|_| AdapterError::Invalid("prompt must be UTF-8".into()))?
            .to_string();
        self.cmd_tx
            .send(DriverCmd::Prompt(prompt))
            .map_err(|_| AdapterError::Write("ai session already closed".into()))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.cmd_tx.send(DriverCmd::Close);
        Ok(())
    }

    fn introspect(&self) -> serde_json::Value {
        serde_json::json!({ "pid": self.pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_meta() {
        let args = build_args("run-1", &AiMeta::default());
        assert_eq!(args[0], "--print");
        assert!(args.contains(&"stream-json".to_string()));
        let idx = args.iter().position(|a| a == "--session-id").unwrap();
        assert_eq!(args[idx + 1], "run-1");
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn args_full_meta() {
        let meta: AiMeta = serde_json::from_value(serde_json::json!({
            "model": "sonnet",
            "permissionMode": "bypassPermissions",
            "maxTurns": 5,
            "allowedTools": ["Bash", "Read"],
            "disallowedTools": ["WebSearch"],
            "systemPrompt": "be terse",
        }))
        .unwrap();
        let args = build_args("run-2", &meta);
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(args.windows(2).any(|w| w == ["--max-turns", "5"]));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Bash,Read"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["--disallowedTools", "WebSearch"])
        );
        assert!(args.windows(2).any(|w| w == ["--system-prompt", "be terse"]));
    }

    #[test]
    fn args_named_permission_mode() {
        let meta: AiMeta =
            serde_json::from_value(serde_json::json!({"permissionMode": "plan"})).unwrap();
        let args = build_args("run-3", &meta);
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "plan"]));
    }

    #[test]
    fn translate_text_delta() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hel"}}"#;
        let (events, done) = translate_line(line, true);
        assert!(!done);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, channel::AI_DELTA);
        assert_eq!(events[0].event_type, event_type::STREAM);
        let payload: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(payload["text"], "hel");
    }

    #[test]
    fn translate_delta_suppressed_when_streaming_off() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hel"}}"#;
        let (events, _) = translate_line(line, false);
        assert!(events.is_empty());
    }

    #[test]
    fn translate_assistant_message() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"pong"}]}}"#;
        let (events, done) = translate_line(line, true);
        assert!(!done);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, channel::AI_MESSAGE);
        assert_eq!(events[0].event_type, event_type::ASSISTANT);
        let payload: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(payload["role"], "assistant");
    }

    #[test]
    fn translate_result_success() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.03,"num_turns":2,"duration_ms":1200,"result":"done","usage":{"input_tokens":10}}"#;
        let (events, done) = translate_line(line, true);
        assert!(done);
        assert_eq!(events[0].channel, channel::AI_RESULT);
        assert_eq!(events[0].event_type, event_type::SUCCESS);
        let payload: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(payload["costUsd"], 0.03);
        assert_eq!(payload["turns"], 2);
        assert_eq!(payload["usage"]["input_tokens"], 10);
    }

    #[test]
    fn translate_result_error_subtype() {
        let line = r#"{"type":"result","subtype":"error_max_turns","num_turns":5}"#;
        let (events, done) = translate_line(line, true);
        assert!(done);
        assert_eq!(events[0].event_type, event_type::ERROR);
        let payload: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(payload["subtype"], "error_max_turns");
    }

    #[test]
    fn translate_ignores_noise() {
        assert!(translate_line("not json at all", true).0.is_empty());
        assert!(
            translate_line(r#"{"type":"system","subtype":"init"}"#, true)
                .0
                .is_empty()
        );
        assert!(translate_line(r#"{"type":"user"}"#, true).0.is_empty());
    }
}
