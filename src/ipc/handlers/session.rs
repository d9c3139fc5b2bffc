use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::info;

fn handle_session_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let identity = match db::resolve_identity(conn, &email) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "no account for this email",
                Some(json!({ "email": db::normalize_email(&email) })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    info!(
        account = identity.account_id(),
        role = identity.role().as_str(),
        "session opened"
    );
    let payload = identity.to_json();
    state.session = Some(identity);
    ok(&req.id, payload)
}

fn handle_session_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({ "session": state.session.as_ref().map(|s| s.to_json()) }),
    )
}

fn handle_session_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(prev) = state.session.take() {
        info!(account = prev.account_id(), "session closed");
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.open" => Some(handle_session_open(state, req)),
        "session.get" => Some(handle_session_get(state, req)),
        "session.close" => Some(handle_session_close(state, req)),
        _ => None,
    }
}
