use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use serde::Deserialize;
use serde_json::json;

use super::{AdapterError, AdapterFactory, EventSink, ProcessHandle};
use crate::runs::{RawEvent, channel, event_type};
use crate::workspace::WorkspaceRoot;

/// Snapshot reads are capped; anything larger arrives truncated with a flag.
const MAX_SNAPSHOT_BYTES: usize = 1024 * 1024;

/// Kind-specific meta for `file-editor` sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileEditorMeta {
    /// Directory the session edits under; must sit inside the workspace root.
    pub root: Option<String>,
    /// Emit `file:changed` events for external modifications.
    pub watch: bool,
}

impl Default for FileEditorMeta {
    fn default() -> Self {
        Self {
            root: None,
            watch: true,
        }
    }
}

/// Commands accepted on `write`, as JSON.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum EditorCommand {
    Open {
        path: String,
    },
    Save {
        path: String,
        content: String,
    },
    List {
        #[serde(default)]
        path: String,
    },
}

/// Drives workspace-jailed file operations as a session: open/save/list
/// commands in, `file:*` events out. Failed operations emit `file:error` and
/// leave the session running.
pub struct FileEditorAdapter {
    workspace: WorkspaceRoot,
}

impl FileEditorAdapter {
    pub fn new(workspace: WorkspaceRoot) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl AdapterFactory for FileEditorAdapter {
    fn kind(&self) -> &'static str {
        "file-editor"
    }

    async fn open(
        &self,
        run_id: &str,
        meta: &serde_json::Value,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, AdapterError> {
        let meta: FileEditorMeta = serde_json::from_value(meta.clone())
            .map_err(|e| AdapterError::Invalid(format!("file-editor meta: {e}")))?;

        let root = match &meta.root {
            Some(root) => self
                .workspace
                .validate(root)
                .map_err(|e| AdapterError::Invalid(e.to_string()))?,
            None => self.workspace.root().to_path_buf(),
        };
        std::fs::create_dir_all(&root)?;

        let debouncer = if meta.watch {
            Some(start_watcher(&root, events.clone())?)
        } else {
            None
        };

        tracing::info!(run_id = %run_id, root = %root.display(), watch = meta.watch, "file-editor session opened");
        events.emit(RawEvent::status_opened());

        Ok(Box::new(FileEditorHandle {
            root,
            events,
            debouncer: std::sync::Mutex::new(debouncer),
            closed: AtomicBool::new(false),
        }))
    }
}

type FsDebouncer = notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>;

/// Debounced watcher on the session root; external edits become
/// `file:changed` events. Dropping the debouncer stops the watcher thread.
fn start_watcher(root: &Path, events: EventSink) -> Result<FsDebouncer, AdapterError> {
    let watch_root = root.to_path_buf();
    let mut debouncer = new_debouncer(
        std::time::Duration::from_millis(500),
        move |batch: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "fs watcher error");
                    return;
                }
            };
            for event in batch {
                if event.kind != DebouncedEventKind::Any {
                    continue;
                }
                let rel = match event.path.strip_prefix(&watch_root) {
                    Ok(rel) => rel.to_string_lossy().to_string(),
                    Err(_) => continue,
                };
                // Atomic-save temp files are renamed away immediately.
                if rel.ends_with(".tmp") {
                    continue;
                }
                events.emit(RawEvent::json(
                    channel::FILE_CHANGED,
                    event_type::JSON,
                    &json!({ "path": rel }),
                ));
            }
        },
    )
    .map_err(|e| AdapterError::Spawn(format!("fs watcher: {e}")))?;

    debouncer
        .watcher()
        .watch(root, notify::RecursiveMode::Recursive)
        .map_err(|e| AdapterError::Spawn(format!("fs watch {}: {e}", root.display())))?;

    Ok(debouncer)
}

struct FileEditorHandle {
    root: PathBuf,
    events: EventSink,
    debouncer: std::sync::Mutex<Option<FsDebouncer>>,
    closed: AtomicBool,
}

impl FileEditorHandle {
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        WorkspaceRoot::resolve_under(&self.root, path).map_err(|e| e.to_string())
    }

    fn emit_error(&self, message: String) {
        self.events.emit(RawEvent::json(
            channel::FILE_ERROR,
            event_type::JSON,
            &json!({ "message": message }),
        ));
    }

    fn run_open(&self, path: &str) {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return self.emit_error(e),
        };
        let bytes = match std::fs::read(&resolved) {
            Ok(b) => b,
            Err(e) => return self.emit_error(format!("read {path}: {e}")),
        };
        let truncated = bytes.len() > MAX_SNAPSHOT_BYTES;
        let bytes = if truncated {
            &bytes[..MAX_SNAPSHOT_BYTES]
        } else {
            &bytes[..]
        };
        self.events.emit(RawEvent::json(
            channel::FILE_CONTENT,
            event_type::SNAPSHOT,
            &json!({
                "path": path,
                "content": String::from_utf8_lossy(bytes),
                "truncated": truncated,
            }),
        ));
    }

    fn run_save(&self, path: &str, content: &str) {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return self.emit_error(e),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return self.emit_error(format!("mkdir for {path}: {e}"));
            }
        }
        // Atomic write via temp + rename so watchers and readers never see a
        // half-written file.
        let tmp = resolved.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, content) {
            return self.emit_error(format!("write {path}: {e}"));
        }
        if let Err(e) = std::fs::rename(&tmp, &resolved) {
            return self.emit_error(format!("rename {path}: {e}"));
        }
        self.events.emit(RawEvent::json(
            channel::FILE_SAVED,
            event_type::JSON,
            &json!({ "path": path, "bytes": content.len() }),
        ));
    }

    fn run_list(&self, path: &str) {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return self.emit_error(e),
        };
        let read_dir = match std::fs::read_dir(&resolved) {
            Ok(rd) => rd,
            Err(e) => return self.emit_error(format!("list {path}: {e}")),
        };
        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "isDir": meta.is_dir(),
                "size": if meta.is_file() { Some(meta.len()) } else { None },
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        self.events.emit(RawEvent::json(
            channel::FILE_LISTING,
            event_type::JSON,
            &json!({ "path": path, "entries": entries }),
        ));
    }
}

#[async_trait]
impl ProcessHandle for FileEditorHandle {
    fn kind(&self) -> &'static str {
        "file-editor"
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        let command: EditorCommand = match serde_json::from_slice(data) {
            Ok(c) => c,
            Err(e) => {
                // Malformed commands are a client mistake, not a session fault.
                self.emit_error(format!("invalid editor command: {e}"));
                return Ok(());
            }
        };
        match command {
            EditorCommand::Open { path } => self.run_open(&path),
            EditorCommand::Save { path, content } => self.run_save(&path, &content),
            EditorCommand::List { path } => self.run_list(&path),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut guard) = self.debouncer.lock() {
            guard.take();
        }
        self.events
            .emit(RawEvent::status_closed(json!({ "exitCode": 0 })));
        Ok(())
    }

    fn introspect(&self) -> serde_json::Value {
        json!({ "root": self.root.display().to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RawEvent;
    use tokio::sync::mpsc;

    async fn open_session(
        dir: &Path,
    ) -> (Box<dyn ProcessHandle>, mpsc::UnboundedReceiver<RawEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("r1", tx);
        let factory = FileEditorAdapter::new(WorkspaceRoot::new(dir.to_path_buf()));
        let handle = factory
            .open("r1", &json!({ "watch": false }), sink)
            .await
            .unwrap();
        // First event is always `opened`.
        let opened = rx.recv().await.unwrap();
        assert!(opened.is_opened());
        (handle, rx)
    }

    #[tokio::test]
    async fn save_then_open_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut rx) = open_session(tmp.path()).await;

        let save = json!({"op": "save", "path": "notes/hello.txt", "content": "hi there"});
        handle
            .write(serde_json::to_vec(&save).unwrap().as_slice())
            .await
            .unwrap();
        let saved = rx.recv().await.unwrap();
        assert_eq!(saved.channel, channel::FILE_SAVED);

        let open = json!({"op": "open", "path": "notes/hello.txt"});
        handle
            .write(serde_json::to_vec(&open).unwrap().as_slice())
            .await
            .unwrap();
        let content = rx.recv().await.unwrap();
        assert_eq!(content.channel, channel::FILE_CONTENT);
        let payload: serde_json::Value = serde_json::from_slice(&content.payload).unwrap();
        assert_eq!(payload["content"], "hi there");
        assert_eq!(payload["truncated"], false);
    }

    #[tokio::test]
    async fn list_returns_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let (handle, mut rx) = open_session(tmp.path()).await;

        handle
            .write(br#"{"op": "list", "path": "/"}"#)
            .await
            .unwrap();
        let listing = rx.recv().await.unwrap();
        assert_eq!(listing.channel, channel::FILE_LISTING);
        let payload: serde_json::Value = serde_json::from_slice(&listing.payload).unwrap();
        let entries = payload["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "a.txt");
        assert_eq!(entries[1]["isDir"], true);
    }

    #[tokio::test]
    async fn traversal_is_rejected_as_file_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut rx) = open_session(tmp.path()).await;

        handle
            .write(br#"{"op": "open", "path": "../outside.txt"}"#)
            .await
            .unwrap();
        let err = rx.recv().await.unwrap();
        assert_eq!(err.channel, channel::FILE_ERROR);
    }

    #[tokio::test]
    async fn malformed_command_is_recoverable() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut rx) = open_session(tmp.path()).await;

        handle.write(b"not json").await.unwrap();
        let err = rx.recv().await.unwrap();
        assert_eq!(err.channel, channel::FILE_ERROR);

        // Session still works afterwards.
        handle
            .write(br#"{"op": "save", "path": "f.txt", "content": "x"}"#)
            .await
            .unwrap();
        let saved = rx.recv().await.unwrap();
        assert_eq!(saved.channel, channel::FILE_SAVED);
    }

    #[tokio::test]
    async fn close_emits_exactly_one_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut rx) = open_session(tmp.path()).await;

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        let closed = rx.recv().await.unwrap();
        assert!(closed.is_terminal());
        assert!(rx.try_recv().is_err());
    }
}
