use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Deserialize;

use super::{AdapterError, AdapterFactory, EventSink, ProcessHandle};
use crate::runs::{RawEvent, channel, event_type};
use crate::workspace::WorkspaceRoot;

/// Kind-specific meta for `pty` sessions.
///
/// `encoding` is stored back to clients untouched: the server forwards raw
/// PTY bytes either way and the client decides how to decode them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PtyMeta {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub encoding: PtyEncoding,
    /// TERM value, default `xterm-256color`.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyEncoding {
    Utf8,
    Binary,
}

impl Default for PtyMeta {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            shell: None,
            args: Vec::new(),
            cols: 80,
            rows: 24,
            encoding: PtyEncoding::Utf8,
            name: "xterm-256color".to_string(),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

enum SignalAction {
    /// Written to the master so the line discipline delivers SIGINT.
    WriteByte(u8),
    Kill,
}

fn parse_signal(name: &str) -> Option<SignalAction> {
    match name {
        "interrupt" => Some(SignalAction::WriteByte(0x03)),
        "terminate" => Some(SignalAction::Kill),
        _ => None,
    }
}

/// Spawns a shell inside a pseudo-terminal and streams its output as
/// `pty:stdout/chunk` events. A single blocking reader thread owns the master
/// read side; all attached clients see the same byte stream.
pub struct PtyAdapter {
    workspace: WorkspaceRoot,
}

impl PtyAdapter {
    pub fn new(workspace: WorkspaceRoot) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl AdapterFactory for PtyAdapter {
    fn kind(&self) -> &'static str {
        "pty"
    }

    async fn open(
        &self,
        run_id: &str,
        meta: &serde_json::Value,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, AdapterError> {
        let meta: PtyMeta = serde_json::from_value(meta.clone())
            .map_err(|e| AdapterError::Invalid(format!("pty meta: {e}")))?;

        let cwd = match &meta.cwd {
            Some(cwd) => self
                .workspace
                .validate(cwd)
                .map_err(|e| AdapterError::Invalid(e.to_string()))?,
            None => self.workspace.root().to_path_buf(),
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: meta.rows,
                cols: meta.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AdapterError::Spawn(format!("openpty: {e}")))?;

        let shell = meta.shell.clone().unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(&shell);
        cmd.args(&meta.args);
        cmd.cwd(&cwd);
        cmd.env("TERM", &meta.name);
        for (k, v) in &meta.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AdapterError::Spawn(format!("spawn {shell}: {e}")))?;
        // Drop the slave so the master sees EOF when the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AdapterError::Spawn(format!("take_writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AdapterError::Spawn(format!("clone_reader: {e}")))?;

        tracing::info!(
            run_id = %run_id,
            shell = %shell,
            cwd = %cwd.display(),
            pid,
            encoding = ?meta.encoding,
            "pty spawned"
        );

        events.emit(RawEvent::status_opened());

        let child = Arc::new(std::sync::Mutex::new(child));
        spawn_reader(reader, child.clone(), events.clone());

        Ok(Box::new(PtyHandle {
            master: std::sync::Mutex::new(pair.master),
            writer: std::sync::Mutex::new(writer),
            child,
            events,
            pid,
        }))
    }
}

/// Persistent reader: drains the master side until EOF, then reaps the child
/// and emits the terminal status event. Running until EOF (not until exit)
/// means the final kernel buffer is flushed into the log before `closed`.
/// This thread is the only `closed` emitter for the session.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,
    events: EventSink,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    events.emit(RawEvent::new(
                        channel::PTY_STDOUT,
                        event_type::CHUNK,
                        buf[..n].to_vec(),
                    ));
                }
                Err(e) => {
                    tracing::debug!(run_id = %events.run_id(), error = %e, "pty read ended");
                    break;
                }
            }
        }

        let exit_code = reap(&child);
        events.emit(RawEvent::status_closed(serde_json::json!({
            "exitCode": exit_code,
            "signal": serde_json::Value::Null,
        })));
    });
}

/// Wait for the child with a bounded poll so a process that closed its
/// terminal but lingers cannot wedge the reader thread.
fn reap(child: &Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>) -> Option<u32> {
    for _ in 0..100 {
        let status = match child.lock() {
            Ok(mut guard) => guard.try_wait(),
            Err(_) => return None,
        };
        match status {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => std::thread::sleep(std::time::Duration::from_millis(50)),
            Err(_) => return None,
        }
    }
    if let Ok(mut guard) = child.lock() {
        let _ = guard.kill();
        if let Ok(status) = guard.wait() {
            return Some(status.exit_code());
        }
    }
    None
}

struct PtyHandle {
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    writer: std::sync::Mutex<Box<dyn Write + Send>>,
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,
    events: EventSink,
    pid: Option<u32>,
}

impl PtyHandle {
    fn write_bytes(&self, data: &[u8]) -> Result<(), AdapterError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| AdapterError::Write("pty writer poisoned".into()))?;
        writer
            .write_all(data)
            .map_err(|e| AdapterError::Write(format!("pty write: {e}")))?;
        writer
            .flush()
            .map_err(|e| AdapterError::Write(format!("pty flush: {e}")))?;
        Ok(())
    }

    fn kill_child(&self) {
        if let Ok(mut child) = self.child.lock() {
            // ESRCH is expected when the child already exited.
            if let Err(e) = child.kill() {
                tracing::trace!(error = %e, "pty child kill");
            }
        }
    }
}

#[async_trait]
impl ProcessHandle for PtyHandle {
    fn kind(&self) -> &'static str {
        "pty"
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        self.write_bytes(data)
    }

    async fn close(&self) -> Result<(), AdapterError> {
        // The reader thread emits `closed` once it drains to EOF.
        self.kill_child();
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), AdapterError> {
        {
            let master = self
                .master
                .lock()
                .map_err(|_| AdapterError::Write("pty master poisoned".into()))?;
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| AdapterError::Write(format!("pty resize: {e}")))?;
        }
        self.events.emit_json(
            channel::PTY_RESIZE,
            event_type::DIMENSIONS,
            serde_json::json!({ "cols": cols, "rows": rows }),
        );
        Ok(())
    }

    async fn signal(&self, name: &str) -> Result<(), AdapterError> {
        match parse_signal(name) {
            Some(SignalAction::WriteByte(b)) => self.write_bytes(&[b]),
            Some(SignalAction::Kill) => {
                self.kill_child();
                Ok(())
            }
            None => Err(AdapterError::Invalid(format!("unknown signal: {name}"))),
        }
    }

    fn introspect(&self) -> serde_json::Value {
        serde_json::json!({ "pid": self.pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_defaults() {
        let meta: PtyMeta = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(meta.cols, 80);
        assert_eq!(meta.rows, 24);
        assert_eq!(meta.encoding, PtyEncoding::Utf8);
        assert_eq!(meta.name, "xterm-256color");
        assert!(meta.cwd.is_none());
        assert!(meta.args.is_empty());
    }

    #[test]
    fn meta_overrides() {
        let meta: PtyMeta = serde_json::from_value(serde_json::json!({
            "cwd": "/workspace/demo",
            "shell": "/bin/zsh",
            "args": ["-l"],
            "cols": 120,
            "rows": 40,
            "encoding": "binary",
            "name": "vt100",
            "env": {"FOO": "bar"},
        }))
        .unwrap();
        assert_eq!(meta.cwd.as_deref(), Some("/workspace/demo"));
        assert_eq!(meta.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(meta.args, vec!["-l"]);
        assert_eq!(meta.cols, 120);
        assert_eq!(meta.rows, 40);
        assert_eq!(meta.encoding, PtyEncoding::Binary);
        assert_eq!(meta.name, "vt100");
        assert_eq!(meta.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn meta_rejects_wrong_types() {
        let result: Result<PtyMeta, _> =
            serde_json::from_value(serde_json::json!({"cols": "eighty"}));
        assert!(result.is_err());
    }

    #[test]
    fn default_shell_is_never_empty() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn signal_names() {
        assert!(matches!(
            parse_signal("interrupt"),
            Some(SignalAction::WriteByte(0x03))
        ));
        assert!(matches!(parse_signal("terminate"), Some(SignalAction::Kill)));
        assert!(parse_signal("hup").is_none());
    }
}
