//! Socket wire protocol.
//!
//! Messages are JSON objects over WebSocket text frames. Request–response
//! messages carry an `id` the server echoes back in an `ack`; streamed
//! `run:event` messages have no ack. The envelope discriminator is `type`,
//! so an event's own discriminator travels as `eventType`.
//!
//! Payloads follow the `(channel, type)` lookup in `runs::payload_shape`:
//! JSON documents are inlined (`"encoding": "json"`), opaque bytes are
//! base64-wrapped (`"encoding": "base64"`).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::runs::{PayloadShape, SessionEvent, channel, event_type, now_ms, payload_shape};

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { id: Option<u64>, key: String },

    #[serde(rename = "client:hello")]
    Hello {
        id: Option<u64>,
        #[serde(rename = "clientId")]
        client_id: String,
    },

    #[serde(rename = "run:attach")]
    Attach {
        id: Option<u64>,
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "afterSeq", default)]
        after_seq: i64,
    },

    /// Fire-and-forget; no ack. Faults surface as log events.
    #[serde(rename = "run:input")]
    Input {
        #[serde(rename = "runId")]
        run_id: String,
        data: String,
        #[serde(default)]
        binary: bool,
    },

    #[serde(rename = "run:resize")]
    Resize {
        id: Option<u64>,
        #[serde(rename = "runId")]
        run_id: String,
        cols: u16,
        rows: u16,
    },

    /// Deliver a named signal (`interrupt`, `terminate`) to the adapter.
    #[serde(rename = "run:signal")]
    Signal {
        id: Option<u64>,
        #[serde(rename = "runId")]
        run_id: String,
        name: String,
    },

    #[serde(rename = "run:close")]
    Close {
        id: Option<u64>,
        #[serde(rename = "runId")]
        run_id: String,
    },

    #[serde(rename = "run:detach")]
    Detach {
        id: Option<u64>,
        #[serde(rename = "runId")]
        run_id: String,
    },
}

pub fn ack_ok(id: Option<u64>, extra: Value) -> Value {
    let mut msg = serde_json::Map::new();
    msg.insert("type".into(), json!("ack"));
    if let Some(id) = id {
        msg.insert("id".into(), json!(id));
    }
    msg.insert("ok".into(), json!(true));
    if let Value::Object(extra) = extra {
        msg.extend(extra);
    }
    Value::Object(msg)
}

pub fn ack_error(id: Option<u64>, err: &CoreError) -> Value {
    let mut msg = serde_json::Map::new();
    msg.insert("type".into(), json!("ack"));
    if let Some(id) = id {
        msg.insert("id".into(), json!(id));
    }
    msg.insert("ok".into(), json!(false));
    msg.insert(
        "error".into(),
        json!({ "kind": err.kind(), "message": err.to_string() }),
    );
    Value::Object(msg)
}

/// One persisted event as a `run:event` message.
pub fn encode_event(event: &SessionEvent) -> Value {
    let (payload, encoding) = match payload_shape(&event.channel, &event.event_type) {
        PayloadShape::Json => match serde_json::from_slice::<Value>(&event.payload) {
            Ok(value) => (value, "json"),
            // A JSON-shaped channel carrying non-JSON bytes still round-trips.
            Err(_) => (Value::String(BASE64.encode(&event.payload)), "base64"),
        },
        PayloadShape::Binary => (Value::String(BASE64.encode(&event.payload)), "base64"),
    };
    json!({
        "type": "run:event",
        "runId": event.run_id,
        "seq": event.seq,
        "channel": event.channel,
        "eventType": event.event_type,
        "payload": payload,
        "encoding": encoding,
        "ts": event.ts,
    })
}

/// Per-socket terminal notice for a dropped slow subscriber. Not part of the
/// run's log, hence `seq` 0; the client re-attaches from its own cursor.
pub fn subscriber_slow(run_id: &str, last_seq: i64) -> Value {
    json!({
        "type": "run:event",
        "runId": run_id,
        "seq": 0,
        "channel": channel::SYSTEM_STATUS,
        "eventType": event_type::SUBSCRIBER_SLOW,
        "payload": { "lastSeq": last_seq },
        "encoding": "json",
        "ts": now_ms(),
    })
}

/// Decode a `run:input` data field into raw bytes.
pub fn decode_input(data: &str, binary: bool) -> Result<Vec<u8>, CoreError> {
    if binary {
        BASE64
            .decode(data)
            .map_err(|e| CoreError::InvalidInput(format!("bad base64 input: {e}")))
    } else {
        Ok(data.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_message_type() {
        let auth: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","id":1,"key":"k"}"#).unwrap();
        assert!(matches!(auth, ClientMessage::Auth { id: Some(1), .. }));

        let hello: ClientMessage =
            serde_json::from_str(r#"{"type":"client:hello","clientId":"dev-a"}"#).unwrap();
        assert!(matches!(hello, ClientMessage::Hello { id: None, .. }));

        let attach: ClientMessage =
            serde_json::from_str(r#"{"type":"run:attach","id":2,"runId":"r1"}"#).unwrap();
        match attach {
            ClientMessage::Attach {
                run_id, after_seq, ..
            } => {
                assert_eq!(run_id, "r1");
                assert_eq!(after_seq, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let input: ClientMessage =
            serde_json::from_str(r#"{"type":"run:input","runId":"r1","data":"ls\n"}"#).unwrap();
        assert!(matches!(input, ClientMessage::Input { binary: false, .. }));

        let resize: ClientMessage = serde_json::from_str(
            r#"{"type":"run:resize","id":3,"runId":"r1","cols":120,"rows":40}"#,
        )
        .unwrap();
        assert!(matches!(resize, ClientMessage::Resize { cols: 120, .. }));

        let signal: ClientMessage =
            serde_json::from_str(r#"{"type":"run:signal","runId":"r1","name":"interrupt"}"#)
                .unwrap();
        assert!(matches!(signal, ClientMessage::Signal { .. }));

        let close: ClientMessage =
            serde_json::from_str(r#"{"type":"run:close","id":4,"runId":"r1"}"#).unwrap();
        assert!(matches!(close, ClientMessage::Close { .. }));

        let detach: ClientMessage =
            serde_json::from_str(r#"{"type":"run:detach","runId":"r1"}"#).unwrap();
        assert!(matches!(detach, ClientMessage::Detach { .. }));
    }

    #[test]
    fn unknown_message_type_fails() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"run:teleport","runId":"r1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn ack_ok_merges_extra_fields() {
        let msg = ack_ok(Some(7), json!({ "backlog": [] }));
        assert_eq!(msg["type"], "ack");
        assert_eq!(msg["id"], 7);
        assert_eq!(msg["ok"], true);
        assert!(msg["backlog"].as_array().unwrap().is_empty());
    }

    #[test]
    fn ack_error_carries_kind_and_message() {
        let msg = ack_error(Some(3), &CoreError::NotFound("r9".into()));
        assert_eq!(msg["ok"], false);
        assert_eq!(msg["error"]["kind"], "NotFound");
        assert!(
            msg["error"]["message"]
                .as_str()
                .unwrap()
                .contains("r9")
        );
    }

    fn event(channel: &str, event_type: &str, payload: &[u8]) -> SessionEvent {
        SessionEvent {
            run_id: "r1".into(),
            seq: 5,
            channel: channel.into(),
            event_type: event_type.into(),
            payload: payload.to_vec(),
            ts: 1000,
        }
    }

    #[test]
    fn encode_json_payload_inlines_value() {
        let ev = event(channel::SYSTEM_STATUS, event_type::OPENED, b"{\"a\":1}");
        let msg = encode_event(&ev);
        assert_eq!(msg["type"], "run:event");
        assert_eq!(msg["seq"], 5);
        assert_eq!(msg["eventType"], "opened");
        assert_eq!(msg["encoding"], "json");
        assert_eq!(msg["payload"]["a"], 1);
    }

    #[test]
    fn encode_binary_payload_base64_round_trips() {
        let raw: Vec<u8> = vec![0, 159, 146, 150, 255];
        let ev = event(channel::PTY_STDOUT, event_type::CHUNK, &raw);
        let msg = encode_event(&ev);
        assert_eq!(msg["encoding"], "base64");
        let decoded = BASE64.decode(msg["payload"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn encode_falls_back_to_base64_on_bad_json() {
        let ev = event(channel::AI_MESSAGE, event_type::ASSISTANT, b"\xff\xfe");
        let msg = encode_event(&ev);
        assert_eq!(msg["encoding"], "base64");
    }

    #[test]
    fn subscriber_slow_notice_shape() {
        let msg = subscriber_slow("r1", 42);
        assert_eq!(msg["seq"], 0);
        assert_eq!(msg["eventType"], "subscriber_slow");
        assert_eq!(msg["payload"]["lastSeq"], 42);
    }

    #[test]
    fn decode_input_modes() {
        assert_eq!(decode_input("ls\n", false).unwrap(), b"ls\n");
        assert_eq!(decode_input("aGk=", true).unwrap(), b"hi");
        assert!(decode_input("not base64!!!", true).is_err());
    }
}
