use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{RwLock, broadcast, mpsc, watch};

use crate::adapters::{AdapterRegistry, EventSink, ProcessHandle};
use crate::error::CoreError;
use crate::runs::{RawEvent, RunSession, SessionEvent, SessionStatus, channel, event_type};
use crate::store::{EventStore, StoreError};

/// Fan-out channel depth per run. A subscriber that falls this far behind the
/// live stream gets a `Lagged` receive and is dropped by the gateway.
const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Optional adapter operations a client can invoke on a running session.
#[derive(Debug, Clone)]
pub enum Capability {
    Resize { cols: u16, rows: u16 },
    Signal { name: String },
    Clear,
    Pause,
    Resume,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Resize { .. } => "resize",
            Capability::Signal { .. } => "signal",
            Capability::Clear => "clear",
            Capability::Pause => "pause",
            Capability::Resume => "resume",
        }
    }
}

struct LiveRun {
    handle: Arc<dyn ProcessHandle>,
    events_tx: broadcast::Sender<Arc<SessionEvent>>,
    status_rx: watch::Receiver<SessionStatus>,
    sink: EventSink,
}

type LiveMap = Arc<RwLock<HashMap<String, LiveRun>>>;

/// The session broker: the only component that knows both the event store and
/// the adapters, and the only writer to the event store.
///
/// Every live run gets a pump task that drains the adapter's emissions,
/// appends them (assigning `seq`/`ts`) and broadcasts only after the append
/// succeeded, so subscribers never observe an event that is not durable. The
/// pump being the single consumer of the per-run queue is the per-run
/// serialization token.
pub struct RunSessionManager {
    store: Arc<EventStore>,
    registry: AdapterRegistry,
    live: LiveMap,
    close_grace: Duration,
}

impl RunSessionManager {
    pub fn new(store: Arc<EventStore>, registry: AdapterRegistry, close_grace: Duration) -> Self {
        Self {
            store,
            registry,
            live: Arc::new(RwLock::new(HashMap::new())),
            close_grace,
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.registry.kinds()
    }

    /// Create a session row, open its adapter and start the event pump.
    /// Returns the new `run_id`; on adapter failure the session is recorded
    /// in `error` with a `system:status/error` event and the error re-raised.
    pub async fn create_run_session(
        &self,
        kind: &str,
        meta: serde_json::Value,
    ) -> Result<String, CoreError> {
        let factory = self
            .registry
            .get(kind)
            .ok_or_else(|| CoreError::UnknownKind(kind.to_string()))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        self.store.create_session(&run_id, kind, &meta).await?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(&run_id, raw_tx);
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);
        let status_tx = Arc::new(status_tx);

        tokio::spawn(pump(
            run_id.clone(),
            raw_rx,
            self.store.clone(),
            events_tx.clone(),
            status_tx.clone(),
            self.live.clone(),
        ));

        match factory.open(&run_id, &meta, sink.clone()).await {
            Ok(handle) => {
                if let Err(e) = self
                    .store
                    .update_status(&run_id, SessionStatus::Running)
                    .await
                {
                    let _ = handle.close().await;
                    return Err(e.into());
                }
                let _ = status_tx.send(SessionStatus::Running);
                // Guarantees `opened` as seq 1 even for adapters that stay
                // quiet until the first input; the pump drops duplicates.
                sink.emit(RawEvent::status_opened());

                let entry = LiveRun {
                    handle: Arc::from(handle),
                    events_tx,
                    status_rx: status_rx.clone(),
                    sink,
                };
                self.live.write().await.insert(run_id.clone(), entry);
                // The adapter may have exited before we registered it.
                let already_terminal = status_rx.borrow().is_terminal();
                if already_terminal {
                    self.live.write().await.remove(&run_id);
                }

                tracing::info!(run_id = %run_id, kind, "run session created");
                Ok(run_id)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, kind, error = %e, "adapter open failed");
                sink.emit(RawEvent::status_error(&format!("adapter open failed: {e}")));
                Err(e.into())
            }
        }
    }

    /// Relay input bytes to a running session's adapter. A write fault is
    /// fatal: the session transitions to `error` with a log event.
    pub async fn send_input(&self, run_id: &str, data: &[u8]) -> Result<(), CoreError> {
        let (handle, sink) = self.running_handle(run_id).await?;
        match handle.write(data).await {
            Ok(()) => Ok(()),
            // A malformed payload is the client's problem, not the adapter's.
            Err(crate::adapters::AdapterError::Invalid(msg)) => {
                Err(CoreError::InvalidInput(msg))
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "adapter write failed; failing session");
                sink.emit(RawEvent::status_error(&format!("adapter write failed: {e}")));
                let closer = handle.clone();
                tokio::spawn(async move {
                    let _ = closer.close().await;
                });
                Err(CoreError::AdapterFault(e))
            }
        }
    }

    /// Invoke an optional capability. A missing capability is a client
    /// protocol error (`CapabilityUnsupported`), never a session fault.
    pub async fn apply_capability(
        &self,
        run_id: &str,
        capability: Capability,
    ) -> Result<(), CoreError> {
        let (handle, _sink) = self.running_handle(run_id).await?;
        tracing::debug!(run_id = %run_id, capability = capability.name(), "applying capability");
        let result = match &capability {
            Capability::Resize { cols, rows } => handle.resize(*cols, *rows).await,
            Capability::Signal { name } => handle.signal(name).await,
            Capability::Clear => handle.clear().await,
            Capability::Pause => handle.pause().await,
            Capability::Resume => handle.resume().await,
        };
        result.map_err(CoreError::from)
    }

    /// Close a session. Idempotent: closing a terminal or unknown-but-stored
    /// session succeeds without a second `closed` event. Waits up to the
    /// configured grace for the adapter's own terminal event, then
    /// synthesizes one with reason `timeout` and force-detaches.
    pub async fn close_run_session(&self, run_id: &str) -> Result<(), CoreError> {
        let (handle, status_rx, sink) = {
            let live = self.live.read().await;
            match live.get(run_id) {
                Some(run) => (run.handle.clone(), run.status_rx.clone(), run.sink.clone()),
                None => {
                    let session = self.store.get_session(run_id).await?;
                    if !session.status.is_terminal() {
                        // Stale row with no live adapter (e.g. lost in a crash).
                        self.store.close(run_id).await?;
                    }
                    return Ok(());
                }
            }
        };

        if status_rx.borrow().is_terminal() {
            return Ok(());
        }

        if let Err(e) = handle.close().await {
            tracing::warn!(run_id = %run_id, error = %e, "adapter close raised");
        }

        if tokio::time::timeout(self.close_grace, wait_terminal(status_rx))
            .await
            .is_err()
        {
            tracing::warn!(run_id = %run_id, "close grace expired; synthesizing closed");
            sink.emit(RawEvent::status_closed(json!({ "reason": "timeout" })));
            self.live.write().await.remove(run_id);
        }
        Ok(())
    }

    /// Passthrough to the store: events with `seq > after_seq`, in order.
    pub async fn get_backlog(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEvent>, CoreError> {
        Ok(self.store.events_since(run_id, after_seq, limit).await?)
    }

    /// Register for this run's live events. Subscribing to a terminal session
    /// succeeds with an immediately-closed stream so attach-for-history works
    /// on one code path.
    pub async fn subscribe(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<Arc<SessionEvent>>, CoreError> {
        if let Some(run) = self.live.read().await.get(run_id) {
            return Ok(run.events_tx.subscribe());
        }
        self.store.get_session(run_id).await?;
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Ok(rx)
    }

    pub async fn get_session(&self, run_id: &str) -> Result<RunSession, CoreError> {
        Ok(self.store.get_session(run_id).await?)
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        kind: Option<&str>,
    ) -> Result<Vec<RunSession>, CoreError> {
        Ok(self.store.list_sessions(status, kind).await?)
    }

    /// Session row plus live-adapter introspection (pid etc.) when attached.
    pub async fn describe(&self, run_id: &str) -> Result<serde_json::Value, CoreError> {
        let session = self.get_session(run_id).await?;
        let live = self.live.read().await;
        let mut value = serde_json::to_value(&session)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        if let Some(run) = live.get(run_id) {
            value["live"] = json!(true);
            value["process"] = run.handle.introspect();
        } else {
            value["live"] = json!(false);
        }
        Ok(value)
    }

    /// Startup recovery: adapters do not survive a restart, so every session
    /// left open by a previous process gets a final `closed` event and a
    /// `stopped` status. Their histories stay queryable.
    pub async fn startup_sweep(&self) -> Result<usize, CoreError> {
        let sessions = self.store.list_sessions(None, None).await?;
        let mut swept = 0usize;
        for session in sessions {
            if session.status.is_terminal() {
                continue;
            }
            let payload = serde_json::to_vec(&json!({ "reason": "server-restart" }))
                .unwrap_or_else(|_| b"{}".to_vec());
            if let Err(e) = self
                .store
                .append_event(
                    &session.run_id,
                    channel::SYSTEM_STATUS,
                    event_type::CLOSED,
                    &payload,
                )
                .await
            {
                tracing::warn!(run_id = %session.run_id, error = %e, "sweep append failed");
            }
            if let Err(e) = self
                .store
                .update_status(&session.run_id, SessionStatus::Stopped)
                .await
            {
                tracing::warn!(run_id = %session.run_id, error = %e, "sweep status update failed");
            }
            swept += 1;
        }
        if swept > 0 {
            tracing::info!(swept, "marked orphaned sessions stopped");
        }
        Ok(swept)
    }

    async fn running_handle(
        &self,
        run_id: &str,
    ) -> Result<(Arc<dyn ProcessHandle>, EventSink), CoreError> {
        let live = self.live.read().await;
        match live.get(run_id) {
            Some(run) => {
                if *run.status_rx.borrow() != SessionStatus::Running {
                    return Err(CoreError::SessionNotRunning(run_id.to_string()));
                }
                Ok((run.handle.clone(), run.sink.clone()))
            }
            None => {
                // Distinguish "never existed" from "exists but not running".
                self.store.get_session(run_id).await?;
                Err(CoreError::SessionNotRunning(run_id.to_string()))
            }
        }
    }
}

async fn wait_terminal(mut rx: watch::Receiver<SessionStatus>) {
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Append one raw event and broadcast the persisted record.
async fn record(
    store: &EventStore,
    events_tx: &broadcast::Sender<Arc<SessionEvent>>,
    run_id: &str,
    raw: &RawEvent,
) -> Result<SessionEvent, StoreError> {
    let event = store
        .append_event(run_id, &raw.channel, &raw.event_type, &raw.payload)
        .await?;
    // No subscribers is fine; backlog covers late joiners.
    let _ = events_tx.send(Arc::new(event.clone()));
    Ok(event)
}

/// Per-run event pump: the single consumer of the adapter's emission queue.
///
/// Enforces the emission discipline regardless of adapter behavior (exactly
/// one `opened`, synthesized when missing; nothing after the terminal event)
/// and owns the status transitions driven by the log.
async fn pump(
    run_id: String,
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    store: Arc<EventStore>,
    events_tx: broadcast::Sender<Arc<SessionEvent>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    live: LiveMap,
) {
    let mut opened_seen = false;
    let mut terminal_seen = false;

    while let Some(raw) = raw_rx.recv().await {
        if raw.is_opened() {
            if opened_seen {
                tracing::debug!(run_id = %run_id, "duplicate opened dropped");
                continue;
            }
            opened_seen = true;
        } else if !opened_seen && !raw.is_terminal() {
            opened_seen = true;
            if let Err(e) = record(&store, &events_tx, &run_id, &RawEvent::status_opened()).await {
                fail_session(&store, &events_tx, &status_tx, &live, &run_id, &e).await;
                terminal_seen = true;
                break;
            }
        }

        match record(&store, &events_tx, &run_id, &raw).await {
            Ok(_) => {
                if raw.is_terminal() {
                    let status = if raw.event_type == event_type::CLOSED {
                        SessionStatus::Stopped
                    } else {
                        SessionStatus::Error
                    };
                    if let Err(e) = store.update_status(&run_id, status).await {
                        tracing::warn!(run_id = %run_id, error = %e, "terminal status update failed");
                    }
                    let _ = status_tx.send(status);
                    terminal_seen = true;
                    break;
                }
            }
            Err(StoreError::SessionTerminated(_)) => {
                // The session was finalized out from under the pump (forced
                // close); later emissions are dropped by design.
                let _ = status_tx.send(SessionStatus::Stopped);
                terminal_seen = true;
                break;
            }
            Err(e) => {
                fail_session(&store, &events_tx, &status_tx, &live, &run_id, &e).await;
                terminal_seen = true;
                break;
            }
        }
    }

    if !terminal_seen {
        // Every sink dropped without a terminal event: the adapter vanished.
        tracing::warn!(run_id = %run_id, "adapter dropped without terminal event");
        let closed = RawEvent::status_closed(json!({ "reason": "adapter-dropped" }));
        if let Err(e) = record(&store, &events_tx, &run_id, &closed).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to record synthetic closed");
        }
        let _ = store.update_status(&run_id, SessionStatus::Stopped).await;
        let _ = status_tx.send(SessionStatus::Stopped);
    }

    live.write().await.remove(&run_id);
    tracing::debug!(run_id = %run_id, "event pump finished");
}

/// Persistence failure escalation: the one error class the session cannot
/// survive. Appends the synthetic error event first (broadcast only if it
/// landed), then flips status and shuts the adapter down.
async fn fail_session(
    store: &EventStore,
    events_tx: &broadcast::Sender<Arc<SessionEvent>>,
    status_tx: &watch::Sender<SessionStatus>,
    live: &LiveMap,
    run_id: &str,
    error: &StoreError,
) {
    tracing::error!(run_id = %run_id, error = %error, "event persist failed; failing session");

    let synthetic = RawEvent::status_error(&format!("event persistence failed: {error}"));
    if let Err(e) = record(store, events_tx, run_id, &synthetic).await {
        tracing::error!(run_id = %run_id, error = %e, "could not record persistence failure");
    }
    if let Err(e) = store.update_status(run_id, SessionStatus::Error).await {
        tracing::error!(run_id = %run_id, error = %e, "could not mark session error");
    }

    let handle = live.read().await.get(run_id).map(|run| run.handle.clone());
    if let Some(handle) = handle {
        tokio::spawn(async move {
            let _ = handle.close().await;
        });
    }
    let _ = status_tx.send(SessionStatus::Error);
}
