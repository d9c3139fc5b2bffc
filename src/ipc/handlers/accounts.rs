use crate::db::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, forbidden, optional_str, required_str, row_exists, session};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_accounts_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let email = match required_str(req, "email") {
        Ok(v) => db::normalize_email(&v),
        Err(e) => return e,
    };
    if !email.contains('@') {
        return err(&req.id, "bad_params", "email must contain '@'", None);
    }
    let role = match required_str(req, "role") {
        Ok(v) => match Role::parse(&v) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: admin, teacher, student",
                    Some(json!({ "role": v })),
                )
            }
        },
        Err(e) => return e,
    };
    let display_name = match required_str(req, "displayName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = optional_str(req, "studentId");

    // The very first account may be created without a session, and must be an admin.
    let existing = match db::account_count(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing == 0 {
        if role != Role::Admin {
            return err(
                &req.id,
                "bad_params",
                "the first account must be an admin",
                None,
            );
        }
    } else {
        match session(state, req) {
            Ok(who) if who.role() == Role::Admin => {}
            Ok(who) => return forbidden(req, who),
            Err(e) => return e,
        }
    }

    match (role, student_id.as_deref()) {
        (Role::Student, None) => {
            return err(
                &req.id,
                "bad_params",
                "student accounts require studentId",
                None,
            )
        }
        (Role::Student, Some(sid)) => {
            match row_exists(conn, req, "SELECT 1 FROM students WHERE id = ?", sid) {
                Ok(true) => {}
                Ok(false) => return err(&req.id, "not_found", "student not found", None),
                Err(e) => return e,
            }
            let linked: Option<String> = match conn
                .query_row(
                    "SELECT id FROM accounts WHERE student_id = ?",
                    [sid],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if linked.is_some() {
                return err(
                    &req.id,
                    "conflict",
                    "student already has an account",
                    Some(json!({ "studentId": sid })),
                );
            }
        }
        (_, Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "studentId is only valid for student accounts",
                None,
            )
        }
        (_, None) => {}
    }

    let taken = match row_exists(conn, req, "SELECT 1 FROM accounts WHERE email = ?", &email) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if taken {
        return err(
            &req.id,
            "conflict",
            "an account with this email already exists",
            Some(json!({ "email": email })),
        );
    }

    let account_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO accounts(id, email, role, display_name, student_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &account_id,
            &email,
            role.as_str(),
            &display_name,
            &student_id,
            db::now_stamp(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "accounts" })),
        );
    }

    ok(
        &req.id,
        json!({
            "accountId": account_id,
            "email": email,
            "role": role.as_str()
        }),
    )
}

fn handle_accounts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match session(state, req) {
        Ok(who) if who.role() == Role::Admin => {}
        Ok(who) => return forbidden(req, who),
        Err(e) => return e,
    }
    let role_filter = match optional_str(req, "role") {
        None => None,
        Some(v) => match Role::parse(&v) {
            Some(r) => Some(r.as_str()),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: admin, teacher, student",
                    None,
                )
            }
        },
    };

    let mut stmt = match conn.prepare(
        "SELECT id, email, role, display_name, student_id
         FROM accounts
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY role, display_name COLLATE NOCASE, email",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([role_filter], |row| {
            let id: String = row.get(0)?;
            let email: String = row.get(1)?;
            let role: String = row.get(2)?;
            let display_name: String = row.get(3)?;
            let student_id: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "email": email,
                "role": role,
                "displayName": display_name,
                "studentId": student_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(accounts) => ok(&req.id, json!({ "accounts": accounts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.create" => Some(handle_accounts_create(state, req)),
        "accounts.list" => Some(handle_accounts_list(state, req)),
        _ => None,
    }
}
