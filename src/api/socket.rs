//! WebSocket gateway: the sole runtime protocol surface of the core.
//!
//! One task per connection reads client messages; one writer task drains the
//! connection's bounded outbound queue; one forwarder task per attachment
//! relays a run's broadcast stream into that queue. A subscriber that cannot
//! keep up overruns its broadcast receiver, gets a `subscriber_slow` notice
//! and is detached; the manager and other subscribers never block on it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use super::AppState;
use super::protocol::{
    ClientMessage, ack_error, ack_ok, decode_input, encode_event, subscriber_slow,
};
use crate::error::CoreError;
use crate::runs::SessionEvent;
use crate::runs::manager::Capability;

/// Per-connection outbound queue depth. When it is full the attachment
/// forwarders block, their broadcast receivers lag, and the slow-subscriber
/// policy kicks in. The manager itself never waits.
const OUTBOUND_BUFFER: usize = 256;

/// Attach backlog cap; longer histories continue over live delivery or a
/// follow-up attach from the new cursor.
const MAX_ATTACH_BACKLOG: usize = 10_000;

pub(crate) async fn socket_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Attachment {
    forwarder: tokio::task::JoinHandle<()>,
}

struct Connection {
    authenticated: bool,
    client_id: Option<String>,
    attachments: HashMap<String, Attachment>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sink
                .send(Message::Text(msg.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut conn = Connection {
        authenticated: false,
        client_id: None,
        attachments: HashMap::new(),
    };

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_message(message, &state, &mut conn, &out_tx).await,
                Err(e) => {
                    let err = CoreError::InvalidInput(format!("malformed message: {e}"));
                    let _ = out_tx.send(ack_error(None, &err)).await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect cancels deliveries to this client only; sessions live on.
    for (_, attachment) in conn.attachments.drain() {
        attachment.forwarder.abort();
    }
    writer.abort();
    tracing::debug!(
        client_id = conn.client_id.as_deref().unwrap_or("-"),
        "socket disconnected"
    );
}

async fn handle_message(
    message: ClientMessage,
    state: &AppState,
    conn: &mut Connection,
    out_tx: &mpsc::Sender<Value>,
) {
    // Until auth succeeds, nothing else is allowed.
    if !conn.authenticated {
        match &message {
            ClientMessage::Auth { .. } => {}
            ClientMessage::Hello { id, .. }
            | ClientMessage::Attach { id, .. }
            | ClientMessage::Resize { id, .. }
            | ClientMessage::Signal { id, .. }
            | ClientMessage::Close { id, .. }
            | ClientMessage::Detach { id, .. } => {
                let _ = out_tx.send(ack_error(*id, &CoreError::Unauthenticated)).await;
                return;
            }
            ClientMessage::Input { .. } => {
                let _ = out_tx
                    .send(ack_error(None, &CoreError::Unauthenticated))
                    .await;
                return;
            }
        }
    }

    match message {
        ClientMessage::Auth { id, key } => {
            if state.auth.is_authorized(&key) {
                conn.authenticated = true;
                let _ = out_tx.send(ack_ok(id, json!({}))).await;
            } else {
                tracing::warn!("socket auth failed");
                let _ = out_tx.send(ack_error(id, &CoreError::Unauthenticated)).await;
            }
        }

        ClientMessage::Hello { id, client_id } => {
            tracing::info!(client_id = %client_id, "client hello");
            conn.client_id = Some(client_id);
            let _ = out_tx.send(ack_ok(id, json!({}))).await;
        }

        ClientMessage::Attach {
            id,
            run_id,
            after_seq,
        } => {
            handle_attach(id, run_id, after_seq, state, conn, out_tx).await;
        }

        ClientMessage::Input {
            run_id,
            data,
            binary,
        } => {
            let bytes = match decode_input(&data, binary) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = out_tx.send(ack_error(None, &e)).await;
                    return;
                }
            };
            // Fire-and-forget: adapter faults land on the run's log as
            // `system:status/error`, not on this connection.
            if let Err(e) = state.manager.send_input(&run_id, &bytes).await {
                tracing::debug!(run_id = %run_id, error = %e, "run:input rejected");
            }
        }

        ClientMessage::Resize {
            id,
            run_id,
            cols,
            rows,
        } => {
            let result = state
                .manager
                .apply_capability(&run_id, Capability::Resize { cols, rows })
                .await;
            let msg = match result {
                Ok(()) => ack_ok(id, json!({})),
                Err(e) => ack_error(id, &e),
            };
            let _ = out_tx.send(msg).await;
        }

        ClientMessage::Signal { id, run_id, name } => {
            let result = state
                .manager
                .apply_capability(&run_id, Capability::Signal { name })
                .await;
            let msg = match result {
                Ok(()) => ack_ok(id, json!({})),
                Err(e) => ack_error(id, &e),
            };
            let _ = out_tx.send(msg).await;
        }

        ClientMessage::Close { id, run_id } => {
            // Close waits out the adapter grace period; do it off the read
            // loop so this connection stays responsive.
            let manager = state.manager.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let msg = match manager.close_run_session(&run_id).await {
                    Ok(()) => ack_ok(id, json!({})),
                    Err(e) => ack_error(id, &e),
                };
                let _ = out_tx.send(msg).await;
            });
        }

        ClientMessage::Detach { id, run_id } => {
            if let Some(attachment) = conn.attachments.remove(&run_id) {
                attachment.forwarder.abort();
            }
            let _ = out_tx.send(ack_ok(id, json!({}))).await;
        }
    }
}

/// Attach = subscribe first, then fetch the backlog, then forward live events
/// with `seq` dedup against the backlog's high-water mark. Events arriving
/// during the fetch wait in the broadcast receiver, so none are lost.
async fn handle_attach(
    id: Option<u64>,
    run_id: String,
    after_seq: i64,
    state: &AppState,
    conn: &mut Connection,
    out_tx: &mpsc::Sender<Value>,
) {
    let rx = match state.manager.subscribe(&run_id).await {
        Ok(rx) => rx,
        Err(e) => {
            let _ = out_tx.send(ack_error(id, &e)).await;
            return;
        }
    };
    let backlog = match state
        .manager
        .get_backlog(&run_id, after_seq, Some(MAX_ATTACH_BACKLOG))
        .await
    {
        Ok(backlog) => backlog,
        Err(e) => {
            let _ = out_tx.send(ack_error(id, &e)).await;
            return;
        }
    };

    let last_seq = backlog.last().map(|e| e.seq).unwrap_or(after_seq);
    let encoded: Vec<Value> = backlog.iter().map(encode_event).collect();
    let _ = out_tx
        .send(ack_ok(
            id,
            json!({ "runId": run_id, "backlog": encoded, "lastSeq": last_seq }),
        ))
        .await;

    // Re-attach replaces the previous forwarder for this run.
    if let Some(previous) = conn.attachments.remove(&run_id) {
        previous.forwarder.abort();
    }
    let forwarder = tokio::spawn(forward_events(
        run_id.clone(),
        state.manager.clone(),
        rx,
        out_tx.clone(),
        last_seq,
    ));
    conn.attachments.insert(run_id, Attachment { forwarder });
}

/// Page size while catching a subscriber up past the attach backlog cap.
const CATCH_UP_PAGE: usize = 1_000;

/// Stream store pages with `seq > last_seq` until the log is drained.
/// Returns the new high-water mark, or None when the connection went away.
async fn catch_up(
    run_id: &str,
    manager: &crate::runs::manager::RunSessionManager,
    out_tx: &mpsc::Sender<Value>,
    mut last_seq: i64,
) -> Option<i64> {
    loop {
        let page = match manager
            .get_backlog(run_id, last_seq, Some(CATCH_UP_PAGE))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "catch-up fetch failed");
                return Some(last_seq);
            }
        };
        if page.is_empty() {
            return Some(last_seq);
        }
        for event in &page {
            last_seq = event.seq;
            if out_tx.send(encode_event(event)).await.is_err() {
                return None;
            }
        }
    }
}

async fn forward_events(
    run_id: String,
    manager: Arc<crate::runs::manager::RunSessionManager>,
    rx: broadcast::Receiver<Arc<SessionEvent>>,
    out_tx: mpsc::Sender<Value>,
    last_seq: i64,
) {
    // Histories longer than the attach cap stream in pages before we go
    // live. The resubscribe-then-page-again step closes the window between
    // the last page and the broadcast tail without relying on the channel
    // buffer holding the whole gap.
    let Some(last_seq) = catch_up(&run_id, &manager, &out_tx, last_seq).await else {
        return;
    };
    let mut rx = rx.resubscribe();
    let Some(mut last_seq) = catch_up(&run_id, &manager, &out_tx, last_seq).await else {
        return;
    };

    loop {
        match rx.recv().await {
            Ok(event) => {
                // Dedup on seq: catch-up pages and the broadcast overlap.
                if event.seq <= last_seq {
                    continue;
                }
                last_seq = event.seq;
                if out_tx.send(encode_event(&event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(run_id = %run_id, skipped, "subscriber too slow; detaching");
                let _ = out_tx.try_send(subscriber_slow(&run_id, last_seq));
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
