use crate::db::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_role, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin]) {
        return e;
    }
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_level = optional_str(req, "gradeLevel");

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, name, grade_level, created_at) VALUES(?, ?, ?, ?)",
        (&section_id, &name, &grade_level, db::now_stamp()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    ok(
        &req.id,
        json!({ "sectionId": section_id, "name": name, "gradeLevel": grade_level }),
    )
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin, Role::Teacher]) {
        return e;
    }

    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.grade_level,
           (SELECT COUNT(*) FROM enrollments e WHERE e.section_id = s.id) AS enrollment_count,
           (SELECT COUNT(*) FROM subject_offerings o WHERE o.section_id = s.id) AS offering_count
         FROM sections s
         ORDER BY s.name COLLATE NOCASE, s.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_level: Option<String> = row.get(2)?;
            let enrollment_count: i64 = row.get(3)?;
            let offering_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLevel": grade_level,
                "enrollmentCount": enrollment_count,
                "offeringCount": offering_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        _ => None,
    }
}
