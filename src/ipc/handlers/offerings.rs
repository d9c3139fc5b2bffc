use crate::calc;
use crate::db::{Identity, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, optional_str, require_role, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_offerings_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin]) {
        return e;
    }
    let subject_name = match required_str(req, "subjectName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match calc::parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match row_exists(conn, req, "SELECT 1 FROM sections WHERE id = ?", &scope.section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return e,
    }
    let teacher_role: Option<String> = match conn
        .query_row(
            "SELECT role FROM accounts WHERE id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match teacher_role.as_deref().and_then(Role::parse) {
        Some(Role::Teacher) => {}
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "teacherId must reference a teacher account",
                Some(json!({ "teacherId": teacher_id })),
            )
        }
        None => return err(&req.id, "not_found", "teacher account not found", None),
    }

    let offering_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subject_offerings(id, subject_name, section_id, school_year, semester, teacher_account_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &offering_id,
            &subject_name,
            &scope.section_id,
            &scope.school_year,
            &scope.semester,
            &teacher_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subject_offerings" })),
        );
    }

    ok(
        &req.id,
        json!({ "offeringId": offering_id, "subjectName": subject_name }),
    )
}

fn handle_offerings_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = match require_role(state, req, &[Role::Admin, Role::Teacher]) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_filter = match who {
        Identity::Teacher { account_id, .. } => Some(account_id.clone()),
        _ => None,
    };
    let section_id = optional_str(req, "sectionId");
    let school_year = optional_str(req, "schoolYear");
    let semester = optional_str(req, "semester");

    let mut stmt = match conn.prepare(
        "SELECT o.id, o.subject_name, o.section_id, sec.name, o.school_year, o.semester,
                o.teacher_account_id, a.display_name,
                (SELECT COUNT(*) FROM subject_grades g
                  WHERE g.offering_id = o.id AND g.final_grade > 0) AS finalized_count
         FROM subject_offerings o
         JOIN sections sec ON sec.id = o.section_id
         LEFT JOIN accounts a ON a.id = o.teacher_account_id
         WHERE (?1 IS NULL OR o.section_id = ?1)
           AND (?2 IS NULL OR o.school_year = ?2)
           AND (?3 IS NULL OR o.semester = ?3)
           AND (?4 IS NULL OR o.teacher_account_id = ?4)
         ORDER BY o.school_year, o.semester, sec.name COLLATE NOCASE, o.subject_name COLLATE NOCASE, o.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&section_id, &school_year, &semester, &teacher_filter), |row| {
            let id: String = row.get(0)?;
            let subject_name: String = row.get(1)?;
            let section_id: String = row.get(2)?;
            let section_name: String = row.get(3)?;
            let school_year: String = row.get(4)?;
            let semester: String = row.get(5)?;
            let teacher_id: Option<String> = row.get(6)?;
            let teacher_name: Option<String> = row.get(7)?;
            let finalized_count: i64 = row.get(8)?;
            Ok(json!({
                "id": id,
                "subjectName": subject_name,
                "sectionId": section_id,
                "sectionName": section_name,
                "schoolYear": school_year,
                "semester": semester,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "finalizedCount": finalized_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(offerings) => ok(&req.id, json!({ "offerings": offerings })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "offerings.create" => Some(handle_offerings_create(state, req)),
        "offerings.list" => Some(handle_offerings_list(state, req)),
        _ => None,
    }
}
