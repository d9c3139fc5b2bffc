use crate::calc::{self, CalcContext};
use crate::db::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, optional_str, require_role, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin]) {
        return e;
    }
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sex = optional_str(req, "sex");
    let student_no = optional_str(req, "studentNo");

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, student_no, last_name, first_name, sex, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &student_no,
            &last_name,
            &first_name,
            &sex,
            db::now_stamp(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "displayName": format!("{}, {}", last_name, first_name)
        }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin, Role::Teacher]) {
        return e;
    }
    let scope = match calc::parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    match calc::load_scope_students(&CalcContext {
        conn,
        scope: &scope,
    }) {
        Ok(students) => {
            let rows = students
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "lastName": s.last_name,
                        "firstName": s.first_name,
                        "displayName": s.display_name(),
                        "sex": s.sex,
                        "studentNo": s.student_no
                    })
                })
                .collect::<Vec<_>>();
            ok(&req.id, json!({ "students": rows }))
        }
        Err(e) => calc_err(req, e),
    }
}

fn handle_enrollments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin]) {
        return e;
    }
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match calc::parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    match row_exists(conn, req, "SELECT 1 FROM students WHERE id = ?", &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e,
    }
    match row_exists(conn, req, "SELECT 1 FROM sections WHERE id = ?", &scope.section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return e,
    }

    let existing: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, section_id FROM enrollments
             WHERE student_id = ? AND school_year = ? AND semester = ?",
            (&student_id, &scope.school_year, &scope.semester),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some((enrollment_id, section_id)) = existing {
        if section_id == scope.section_id {
            return ok(
                &req.id,
                json!({ "enrollmentId": enrollment_id, "created": false }),
            );
        }
        return err(
            &req.id,
            "conflict",
            "student is already enrolled in another section for this school year and semester",
            Some(json!({ "enrollmentId": enrollment_id, "sectionId": section_id })),
        );
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, section_id, school_year, semester)
         VALUES(?, ?, ?, ?, ?)",
        (
            &enrollment_id,
            &student_id,
            &scope.section_id,
            &scope.school_year,
            &scope.semester,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(
        &req.id,
        json!({ "enrollmentId": enrollment_id, "created": true }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "enrollments.set" => Some(handle_enrollments_set(state, req)),
        _ => None,
    }
}
