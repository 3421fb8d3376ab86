//! HTTP shim over manager operations. The socket gateway is the real
//! protocol surface; these routes exist so session CRUD works from plain
//! HTTP clients and the web UI's bootstrap fetch.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::error::CoreError;
use crate::runs::SessionStatus;
use crate::runs::manager::Capability;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/{run_id}",
            get(describe_session).delete(delete_session),
        )
        .route("/sessions/{run_id}/capability", post(invoke_capability))
}

pub(crate) fn error_response(err: CoreError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        CoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::UnknownKind(_)
        | CoreError::InvalidInput(_)
        | CoreError::CapabilityUnsupported(_) => StatusCode::BAD_REQUEST,
        CoreError::SessionNotRunning(_) => StatusCode::CONFLICT,
        CoreError::Persistence(_) | CoreError::AdapterFault(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "error": { "kind": err.kind(), "message": err.to_string() } })),
    )
}

fn default_meta() -> Value {
    json!({})
}

#[derive(Deserialize)]
pub(crate) struct CreateSessionRequest {
    kind: String,
    #[serde(default = "default_meta")]
    meta: Value,
}

/// POST /api/sessions — create a run session.
pub(crate) async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let run_id = state
        .manager
        .create_run_session(&body.kind, body.meta)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(json!({ "runId": run_id }))))
}

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    status: Option<String>,
    kind: Option<String>,
}

/// GET /api/sessions — list sessions, optionally filtered by status/kind.
pub(crate) async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match query.status.as_deref() {
        Some(s) => Some(SessionStatus::parse(s).ok_or_else(|| {
            error_response(CoreError::InvalidInput(format!("unknown status: {s}")))
        })?),
        None => None,
    };
    let sessions = state
        .manager
        .list_sessions(status, query.kind.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// GET /api/sessions/{run_id} — session row plus live process introspection.
pub(crate) async fn describe_session(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let described = state
        .manager
        .describe(&run_id)
        .await
        .map_err(error_response)?;
    Ok(Json(described))
}

#[derive(Deserialize)]
pub(crate) struct CapabilityRequest {
    name: String,
    #[serde(default)]
    args: Value,
}

fn parse_capability(name: &str, args: &Value) -> Result<Capability, CoreError> {
    match name {
        "resize" => {
            let cols = args.get("cols").and_then(Value::as_u64);
            let rows = args.get("rows").and_then(Value::as_u64);
            match (cols, rows) {
                (Some(cols), Some(rows)) if cols <= u16::MAX as u64 && rows <= u16::MAX as u64 => {
                    Ok(Capability::Resize {
                        cols: cols as u16,
                        rows: rows as u16,
                    })
                }
                _ => Err(CoreError::InvalidInput(
                    "resize requires cols and rows".into(),
                )),
            }
        }
        "signal" => {
            let signal = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::InvalidInput("signal requires a name".into()))?;
            Ok(Capability::Signal {
                name: signal.to_string(),
            })
        }
        "clear" => Ok(Capability::Clear),
        "pause" => Ok(Capability::Pause),
        "resume" => Ok(Capability::Resume),
        other => Err(CoreError::InvalidInput(format!(
            "unknown capability: {other}"
        ))),
    }
}

/// POST /api/sessions/{run_id}/capability — invoke an optional adapter
/// operation (resize, signal, clear, pause, resume).
pub(crate) async fn invoke_capability(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<CapabilityRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let capability = parse_capability(&body.name, &body.args).map_err(error_response)?;
    state
        .manager
        .apply_capability(&run_id, capability)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": true })))
}

/// DELETE /api/sessions/{run_id} — close the session (events are retained).
pub(crate) async fn delete_session(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .manager
        .close_run_session(&run_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_taxonomy() {
        let (status, _) = error_response(CoreError::NotFound("r1".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(CoreError::UnknownKind("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(CoreError::SessionNotRunning("r1".into()));
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = error_response(CoreError::Unauthenticated);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn capability_parsing() {
        let cap = parse_capability("resize", &json!({"cols": 120, "rows": 40})).unwrap();
        assert!(matches!(cap, Capability::Resize { cols: 120, rows: 40 }));

        let cap = parse_capability("signal", &json!({"name": "interrupt"})).unwrap();
        assert!(matches!(cap, Capability::Signal { name } if name == "interrupt"));

        assert!(matches!(parse_capability("clear", &json!({})), Ok(Capability::Clear)));
        assert!(matches!(parse_capability("pause", &json!({})), Ok(Capability::Pause)));
        assert!(matches!(parse_capability("resume", &json!({})), Ok(Capability::Resume)));

        assert!(parse_capability("resize", &json!({"cols": 120})).is_err());
        assert!(parse_capability("resize", &json!({"cols": 99999, "rows": 40})).is_err());
        assert!(parse_capability("signal", &json!({})).is_err());
        assert!(parse_capability("teleport", &json!({})).is_err());
    }

    #[test]
    fn create_request_defaults_meta_to_object() {
        let req: CreateSessionRequest = serde_json::from_str(r#"{"kind":"pty"}"#).unwrap();
        assert_eq!(req.meta, json!({}));

        let req: CreateSessionRequest =
            serde_json::from_str(r#"{"kind":"pty","meta":{"cols":120}}"#).unwrap();
        assert_eq!(req.meta["cols"], 120);
    }
}
