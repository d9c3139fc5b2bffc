use crate::calc::CalcError;
use crate::db::{Identity, Role};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if v.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(v)
}

/// Trimmed string param; blank strings read as absent.
pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) })
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn session<'a>(state: &'a AppState, req: &Request) -> Result<&'a Identity, serde_json::Value> {
    state
        .session
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_session", "open a session first", None))
}

pub fn require_role<'a>(
    state: &'a AppState,
    req: &Request,
    allowed: &[Role],
) -> Result<&'a Identity, serde_json::Value> {
    let who = session(state, req)?;
    if allowed.contains(&who.role()) {
        return Ok(who);
    }
    Err(forbidden(req, who))
}

pub fn forbidden(req: &Request, who: &Identity) -> serde_json::Value {
    err(
        &req.id,
        "forbidden",
        format!("{} accounts may not call {}", who.role().as_str(), req.method),
        Some(json!({ "role": who.role().as_str() })),
    )
}

pub fn calc_err(req: &Request, e: CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

pub fn row_exists(
    conn: &Connection,
    req: &Request,
    sql: &str,
    id: &str,
) -> Result<bool, serde_json::Value> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

/// Teachers may only touch offerings they are assigned to.
pub fn ensure_offering_access(
    conn: &Connection,
    req: &Request,
    who: &Identity,
    offering_id: &str,
) -> Result<(), serde_json::Value> {
    let teacher: Option<Option<String>> = conn
        .query_row(
            "SELECT teacher_account_id FROM subject_offerings WHERE id = ?",
            [offering_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some(teacher) = teacher else {
        return Err(err(&req.id, "not_found", "subject offering not found", None));
    };
    match who {
        Identity::Admin { .. } => Ok(()),
        Identity::Teacher { account_id, .. } if teacher.as_deref() == Some(account_id.as_str()) => {
            Ok(())
        }
        _ => Err(forbidden(req, who)),
    }
}
