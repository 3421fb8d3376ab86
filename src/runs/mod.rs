pub mod manager;

use serde::{Deserialize, Serialize};

/// Well-known event channels. The set is open-ended (adapters may emit any
/// namespaced tag), but everything the built-in adapters and the manager
/// produce is listed here.
pub mod channel {
    pub const SYSTEM_STATUS: &str = "system:status";
    pub const PTY_STDOUT: &str = "pty:stdout";
    pub const PTY_RESIZE: &str = "pty:resize";
    pub const AI_DELTA: &str = "ai:delta";
    pub const AI_MESSAGE: &str = "ai:message";
    pub const AI_RESULT: &str = "ai:result";
    pub const AI_ERROR: &str = "ai:error";
    pub const FILE_CONTENT: &str = "file:content";
    pub const FILE_SAVED: &str = "file:saved";
    pub const FILE_LISTING: &str = "file:listing";
    pub const FILE_CHANGED: &str = "file:changed";
    pub const FILE_ERROR: &str = "file:error";
}

/// Discriminators within a channel.
pub mod event_type {
    pub const OPENED: &str = "opened";
    pub const CLOSED: &str = "closed";
    pub const ERROR: &str = "error";
    pub const SUBSCRIBER_SLOW: &str = "subscriber_slow";
    pub const CHUNK: &str = "chunk";
    pub const DIMENSIONS: &str = "dimensions";
    pub const STREAM: &str = "stream";
    pub const ASSISTANT: &str = "assistant";
    pub const SUCCESS: &str = "success";
    pub const INTERRUPT: &str = "interrupt";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const SNAPSHOT: &str = "snapshot";
    pub const JSON: &str = "json";
}

/// Lifecycle status of a run session. `Stopped` and `Error` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// One run session: a single execution of one adapter, identified by `run_id`,
/// with its own append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSession {
    pub run_id: String,
    pub kind: String,
    pub status: SessionStatus,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub updated_at: i64,
    /// Kind-specific options, opaque to the core.
    pub meta: serde_json::Value,
}

/// An immutable record of one I/O or lifecycle occurrence, as persisted.
/// `seq` is per-run, 1-based and gapless; `ts` is non-decreasing per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub run_id: String,
    pub seq: i64,
    pub channel: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub ts: i64,
}

/// An adapter emission before the manager assigns `seq` and `ts`.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub channel: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl RawEvent {
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            channel: channel.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn json(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        value: &serde_json::Value,
    ) -> Self {
        Self::new(
            channel,
            event_type,
            serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec()),
        )
    }

    pub fn status_opened() -> Self {
        Self::json(channel::SYSTEM_STATUS, event_type::OPENED, &serde_json::json!({}))
    }

    pub fn status_closed(payload: serde_json::Value) -> Self {
        Self::json(channel::SYSTEM_STATUS, event_type::CLOSED, &payload)
    }

    pub fn status_error(message: &str) -> Self {
        Self::json(
            channel::SYSTEM_STATUS,
            event_type::ERROR,
            &serde_json::json!({ "message": message }),
        )
    }

    /// Whether this event terminates its session's stream.
    pub fn is_terminal(&self) -> bool {
        self.channel == channel::SYSTEM_STATUS
            && (self.event_type == event_type::CLOSED || self.event_type == event_type::ERROR)
    }

    pub fn is_opened(&self) -> bool {
        self.channel == channel::SYSTEM_STATUS && self.event_type == event_type::OPENED
    }
}

/// How a `(channel, type)` pair's payload is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// UTF-8 JSON document; sent as a structured value.
    Json,
    /// Opaque bytes; sent base64-wrapped.
    Binary,
}

/// The `(channel, type)` → payload-shape lookup. Anything not listed is
/// treated as opaque bytes, which is always lossless.
pub fn payload_shape(channel: &str, event_type: &str) -> PayloadShape {
    match (channel, event_type) {
        (self::channel::PTY_STDOUT, _) => PayloadShape::Binary,
        (self::channel::SYSTEM_STATUS, _)
        | (self::channel::PTY_RESIZE, _)
        | (self::channel::AI_DELTA, _)
        | (self::channel::AI_MESSAGE, _)
        | (self::channel::AI_RESULT, _)
        | (self::channel::AI_ERROR, _)
        | (self::channel::FILE_CONTENT, _)
        | (self::channel::FILE_SAVED, _)
        | (self::channel::FILE_LISTING, _)
        | (self::channel::FILE_CHANGED, _)
        | (self::channel::FILE_ERROR, _) => PayloadShape::Json,
        _ => PayloadShape::Binary,
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_classification() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_raw_events() {
        assert!(RawEvent::status_closed(serde_json::json!({})).is_terminal());
        assert!(RawEvent::status_error("boom").is_terminal());
        assert!(!RawEvent::status_opened().is_terminal());
        assert!(!RawEvent::new(channel::PTY_STDOUT, event_type::CHUNK, vec![1]).is_terminal());
    }

    #[test]
    fn payload_shapes() {
        assert_eq!(
            payload_shape(channel::PTY_STDOUT, event_type::CHUNK),
            PayloadShape::Binary
        );
        assert_eq!(
            payload_shape(channel::SYSTEM_STATUS, event_type::OPENED),
            PayloadShape::Json
        );
        assert_eq!(
            payload_shape(channel::AI_DELTA, event_type::STREAM),
            PayloadShape::Json
        );
        // Unknown channels default to opaque bytes.
        assert_eq!(payload_shape("custom:thing", "blob"), PayloadShape::Binary);
    }

    #[test]
    fn session_serializes_camel_case() {
        let session = RunSession {
            run_id: "r1".into(),
            kind: "pty".into(),
            status: SessionStatus::Running,
            created_at: 1,
            updated_at: 2,
            meta: serde_json::json!({}),
        };
        let v = serde_json::to_value(&session).unwrap();
        assert_eq!(v["runId"], "r1");
        assert_eq!(v["status"], "running");
        assert_eq!(v["createdAt"], 1);
    }
}
