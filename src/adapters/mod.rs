pub mod ai;
pub mod file_editor;
pub mod pty;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::runs::RawEvent;

/// Errors from adapter operations.
///
/// `Unsupported` is the expected return for capability-gated operations a
/// particular adapter does not implement (e.g. `resize` on the AI adapter);
/// the manager maps it to a client protocol error instead of a session fault.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("unsupported capability: {0}")]
    Unsupported(&'static str),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Cloneable emitter handed to an adapter at `open` time.
///
/// Emissions carry only `(channel, type, payload)`; the manager assigns `seq`
/// and `ts` when it records them. Safe to call from any thread: PTY reader
/// threads and watcher callbacks push into the same unbounded queue. Sends
/// after the run's pump has shut down are dropped silently.
#[derive(Clone)]
pub struct EventSink {
    run_id: Arc<str>,
    tx: mpsc::UnboundedSender<RawEvent>,
}

impl EventSink {
    pub(crate) fn new(run_id: &str, tx: mpsc::UnboundedSender<RawEvent>) -> Self {
        Self {
            run_id: run_id.into(),
            tx,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event: RawEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(run_id = %self.run_id, "event dropped after pump shutdown");
        }
    }

    pub fn emit_json(
        &self,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.emit(RawEvent::json(channel, event_type, &value));
    }
}

/// The live reference to one open adapter instance.
///
/// `write` and `close` are mandatory; the rest are optional capabilities
/// whose absence surfaces as `AdapterError::Unsupported` (the Rust rendering
/// of "queried by presence"). Implementations must emit exactly one terminal
/// `system:status/closed` or `system:status/error` event and nothing after it.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Accept a chunk of input. May buffer but must eventually forward.
    async fn write(&self, data: &[u8]) -> Result<(), AdapterError>;

    /// Request graceful termination. Idempotent.
    async fn close(&self) -> Result<(), AdapterError>;

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("resize"))
    }

    async fn signal(&self, _name: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("signal"))
    }

    async fn clear(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("clear"))
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("pause"))
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("resume"))
    }

    fn introspect(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Factory for one session kind. One instance per kind lives in the registry;
/// each `open` call produces an independent handle.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn open(
        &self,
        run_id: &str,
        meta: &serde_json::Value,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, AdapterError>;
}

/// `kind → factory` map, populated once at startup. Adding a session kind is
/// additive: implement the traits, register the factory.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<&'static str, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::channel;

    struct NullHandle;

    #[async_trait]
    impl ProcessHandle for NullHandle {
        fn kind(&self) -> &'static str {
            "null"
        }
        async fn write(&self, _data: &[u8]) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    struct NullFactory;

    #[async_trait]
    impl AdapterFactory for NullFactory {
        fn kind(&self) -> &'static str {
            "null"
        }
        async fn open(
            &self,
            _run_id: &str,
            _meta: &serde_json::Value,
            _events: EventSink,
        ) -> Result<Box<dyn ProcessHandle>, AdapterError> {
            Ok(Box::new(NullHandle))
        }
    }

    #[tokio::test]
    async fn missing_capabilities_report_unsupported() {
        let handle = NullHandle;
        assert!(matches!(
            handle.resize(80, 24).await,
            Err(AdapterError::Unsupported("resize"))
        ));
        assert!(matches!(
            handle.signal("interrupt").await,
            Err(AdapterError::Unsupported("signal"))
        ));
        assert!(matches!(
            handle.pause().await,
            Err(AdapterError::Unsupported("pause"))
        ));
    }

    #[test]
    fn registry_lookup_and_kinds() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullFactory));

        assert!(registry.get("null").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.kinds(), vec!["null"]);
    }

    #[tokio::test]
    async fn sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("r1", tx);

        sink.emit(RawEvent::new(channel::PTY_STDOUT, "chunk", b"a".to_vec()));
        sink.emit(RawEvent::new(channel::PTY_STDOUT, "chunk", b"b".to_vec()));

        assert_eq!(rx.recv().await.unwrap().payload, b"a");
        assert_eq!(rx.recv().await.unwrap().payload, b"b");
    }

    #[test]
    fn sink_send_after_shutdown_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("r1", tx);
        drop(rx);
        // Must not panic.
        sink.emit(RawEvent::status_opened());
    }
}
