use crate::calc;
use crate::db::Identity;
use crate::ipc::error::ok;
use crate::ipc::helpers::{calc_err, db_conn, forbidden, required_str, session};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_reports_student_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = match session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_str(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Students only ever see their own card.
    if let Identity::Student {
        student_id: own, ..
    } = who
    {
        if *own != student_id {
            return forbidden(req, who);
        }
    }

    match calc::compute_student_card(conn, &student_id, &school_year, &semester) {
        Ok(card) => ok(&req.id, json!(card)),
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentCard" => Some(handle_reports_student_card(state, req)),
        _ => None,
    }
}
