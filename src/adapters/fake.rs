//! Scriptable in-process adapter for manager and gateway tests. Behavior is
//! driven entirely through `meta`, so tests exercise the real registry and
//! factory paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{AdapterError, AdapterFactory, EventSink, ProcessHandle};
use crate::runs::{RawEvent, event_type};

pub const FAKE_OUT: &str = "fake:out";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FakeMeta {
    /// Emit `system:status/opened` from the adapter itself.
    pub emit_opened: bool,
    pub fail_open: bool,
    pub fail_write: bool,
    /// Swallow `close()` without emitting a terminal event.
    pub ignore_close: bool,
    /// Echo written bytes back as `fake:out/chunk` events.
    pub echo: bool,
    /// Misbehave: emit one more event after the terminal `closed`.
    pub emit_after_close: bool,
}

impl Default for FakeMeta {
    fn default() -> Self {
        Self {
            emit_opened: true,
            fail_open: false,
            fail_write: false,
            ignore_close: false,
            echo: true,
            emit_after_close: false,
        }
    }
}

pub struct FakeAdapter;

#[async_trait]
impl AdapterFactory for FakeAdapter {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn open(
        &self,
        _run_id: &str,
        meta: &serde_json::Value,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, AdapterError> {
        let meta: FakeMeta = serde_json::from_value(meta.clone())
            .map_err(|e| AdapterError::Invalid(format!("fake meta: {e}")))?;

        if meta.fail_open {
            return Err(AdapterError::Spawn("fake open failure".into()));
        }
        if meta.emit_opened {
            events.emit(RawEvent::status_opened());
        }

        Ok(Box::new(FakeHandle {
            events,
            meta,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeHandle {
    events: EventSink,
    meta: FakeMeta,
    closed: AtomicBool,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        if self.meta.fail_write {
            return Err(AdapterError::Write("fake write failure".into()));
        }
        if self.meta.echo {
            self.events.emit(RawEvent::new(
                FAKE_OUT,
                event_type::CHUNK,
                data.to_vec(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if self.meta.ignore_close {
            return Ok(());
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events
            .emit(RawEvent::status_closed(json!({ "exitCode": 0 })));
        if self.meta.emit_after_close {
            self.events.emit(RawEvent::new(
                FAKE_OUT,
                event_type::CHUNK,
                b"late".to_vec(),
            ));
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), AdapterError> {
        self.events.emit(RawEvent::json(
            "fake:resize",
            event_type::DIMENSIONS,
            &json!({ "cols": cols, "rows": rows }),
        ));
        Ok(())
    }
}
