use crate::calc::{self, CalcContext, HonorDistinction, Quarter, Scope, SubjectGrade};
use crate::db::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, ensure_offering_access, require_role, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

const BOUNDS_KEY: &str = "grading.bounds";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingBounds {
    pub min_score: f64,
    pub max_score: f64,
}

impl Default for GradingBounds {
    fn default() -> Self {
        Self {
            min_score: 60.0,
            max_score: 100.0,
        }
    }
}

impl GradingBounds {
    fn to_json(self) -> Value {
        json!({ "minScore": self.min_score, "maxScore": self.max_score })
    }

    fn contains(self, score: f64) -> bool {
        score >= self.min_score && score <= self.max_score
    }
}

fn merge_bounds_patch(current: &mut GradingBounds, patch: &Map<String, Value>) -> Result<(), String> {
    let mut next = *current;
    for (k, v) in patch {
        let n = v
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| format!("{} must be a number", k))?;
        match k.as_str() {
            "minScore" => next.min_score = n,
            "maxScore" => next.max_score = n,
            _ => return Err(format!("unknown grading field: {}", k)),
        }
    }
    if next.min_score < 0.0 || next.max_score > 100.0 || next.min_score >= next.max_score {
        return Err("bounds must satisfy 0 <= minScore < maxScore <= 100".to_string());
    }
    *current = next;
    Ok(())
}

pub fn load_bounds(conn: &Connection) -> anyhow::Result<GradingBounds> {
    let mut current = GradingBounds::default();
    if let Some(saved) = db::settings_get_json(conn, BOUNDS_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_bounds_patch(&mut current, saved_obj);
        }
    }
    Ok(current)
}

fn offering_scope(conn: &Connection, offering_id: &str) -> rusqlite::Result<Option<Scope>> {
    conn.query_row(
        "SELECT section_id, school_year, semester FROM subject_offerings WHERE id = ?",
        [offering_id],
        |r| {
            Ok(Scope {
                section_id: r.get(0)?,
                school_year: r.get(1)?,
                semester: r.get(2)?,
            })
        },
    )
    .optional()
}

fn load_grade(
    conn: &Connection,
    offering_id: &str,
    student_id: &str,
) -> rusqlite::Result<Option<(SubjectGrade, Option<String>)>> {
    conn.query_row(
        "SELECT student_id, first_quarter, second_quarter, final_grade, distinction, remarks, updated_at
         FROM subject_grades
         WHERE offering_id = ? AND student_id = ?",
        (offering_id, student_id),
        |r| {
            let distinction: Option<String> = r.get(4)?;
            Ok((
                SubjectGrade {
                    student_id: r.get(0)?,
                    first_quarter: r.get(1)?,
                    second_quarter: r.get(2)?,
                    final_grade: r.get(3)?,
                    distinction: distinction.as_deref().and_then(HonorDistinction::from_label),
                    remarks: r.get(5)?,
                },
                r.get(6)?,
            ))
        },
    )
    .optional()
}

fn grade_json(offering_id: &str, grade: &SubjectGrade, updated_at: Option<&str>) -> Value {
    let mut v = json!(grade);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("offeringId".to_string(), json!(offering_id));
        obj.insert("updatedAt".to_string(), json!(updated_at));
    }
    v
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = match require_role(state, req, &[Role::Admin, Role::Teacher]) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(quarter) = req
        .params
        .get("quarter")
        .and_then(|v| v.as_i64())
        .and_then(Quarter::from_number)
    else {
        return err(&req.id, "bad_params", "quarter must be 1 or 2", None);
    };
    let score = match req.params.get("score") {
        None => return err(&req.id, "bad_params", "missing score", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64().filter(|n| n.is_finite()) {
            Some(n) => Some(n),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "score must be a number or null",
                    None,
                )
            }
        },
    };
    let remarks_patch = match req.params.get("remarks") {
        None => None,
        Some(v) if v.is_null() => Some(None),
        Some(v) => match v.as_str() {
            Some(s) => {
                let t = s.trim();
                Some(if t.is_empty() { None } else { Some(t.to_string()) })
            }
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "remarks must be a string or null",
                    None,
                )
            }
        },
    };

    if let Err(e) = ensure_offering_access(conn, req, who, &offering_id) {
        return e;
    }
    let scope = match offering_scope(conn, &offering_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject offering not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrolled: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND section_id = ? AND school_year = ? AND semester = ?",
            (
                &student_id,
                &scope.section_id,
                &scope.school_year,
                &scope.semester,
            ),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled.is_none() {
        return err(
            &req.id,
            "bad_params",
            "student is not enrolled in this offering's section",
            Some(json!({ "studentId": student_id, "offeringId": offering_id })),
        );
    }

    if let Some(n) = score {
        let bounds = match load_bounds(conn) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if !bounds.contains(n) {
            return err(
                &req.id,
                "bad_params",
                format!(
                    "score must be between {} and {}",
                    bounds.min_score, bounds.max_score
                ),
                Some(json!({ "score": n, "bounds": bounds.to_json() })),
            );
        }
    }

    let existing = match load_grade(conn, &offering_id, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let is_new = existing.is_none();
    let mut grade = existing
        .map(|(g, _)| g)
        .unwrap_or_else(|| SubjectGrade::new(student_id.clone()));
    grade.apply_quarter_score(quarter, score);
    if let Some(r) = remarks_patch {
        grade.remarks = r;
    }

    let updated_at = db::now_stamp();
    let distinction = grade.distinction.map(|d| d.label());
    let write = if is_new {
        conn.execute(
            "INSERT INTO subject_grades(id, offering_id, student_id, first_quarter, second_quarter,
                                        final_grade, distinction, remarks, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                &offering_id,
                &student_id,
                grade.first_quarter,
                grade.second_quarter,
                grade.final_grade,
                distinction,
                &grade.remarks,
                &updated_at,
            ),
        )
    } else {
        conn.execute(
            "UPDATE subject_grades
             SET first_quarter = ?, second_quarter = ?, final_grade = ?, distinction = ?,
                 remarks = ?, updated_at = ?
             WHERE offering_id = ? AND student_id = ?",
            (
                grade.first_quarter,
                grade.second_quarter,
                grade.final_grade,
                distinction,
                &grade.remarks,
                &updated_at,
                &offering_id,
                &student_id,
            ),
        )
    };
    if let Err(e) = write {
        let code = if is_new {
            "db_insert_failed"
        } else {
            "db_update_failed"
        };
        return err(
            &req.id,
            code,
            e.to_string(),
            Some(json!({ "table": "subject_grades" })),
        );
    }

    ok(&req.id, grade_json(&offering_id, &grade, Some(updated_at.as_str())))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let who = match require_role(state, req, &[Role::Admin, Role::Teacher]) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_offering_access(conn, req, who, &offering_id) {
        return e;
    }
    let scope = match offering_scope(conn, &offering_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject offering not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match calc::load_scope_students(&CalcContext {
        conn,
        scope: &scope,
    }) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut rows = Vec::with_capacity(students.len());
    for s in &students {
        let loaded = match load_grade(conn, &offering_id, &s.id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let (grade, updated_at) = loaded.unwrap_or_else(|| (SubjectGrade::new(s.id.clone()), None));
        let mut row = grade_json(&offering_id, &grade, updated_at.as_deref());
        if let Some(obj) = row.as_object_mut() {
            obj.insert("displayName".to_string(), json!(s.display_name()));
            obj.insert("sex".to_string(), json!(s.sex));
        }
        rows.push(row);
    }

    ok(
        &req.id,
        json!({ "offeringId": offering_id, "scope": scope, "grades": rows }),
    )
}

fn handle_grading_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin, Role::Teacher, Role::Student]) {
        return e;
    }
    match load_bounds(conn) {
        Ok(b) => ok(&req.id, b.to_json()),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grading_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(state, req, &[Role::Admin]) {
        return e;
    }
    let Some(patch) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };

    let mut current = match load_bounds(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_bounds_patch(&mut current, patch) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, BOUNDS_KEY, &current.to_json()) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, current.to_json())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grading.config.get" => Some(handle_grading_config_get(state, req)),
        "grading.config.update" => Some(handle_grading_config_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_patch_validates_order_and_range() {
        let mut b = GradingBounds::default();
        let patch = json!({ "minScore": 75 });
        merge_bounds_patch(&mut b, patch.as_object().expect("obj")).expect("valid");
        assert_eq!(b.min_score, 75.0);
        assert!(b.contains(75.0));
        assert!(!b.contains(74.5));

        let bad = json!({ "minScore": 100, "maxScore": 90 });
        assert!(merge_bounds_patch(&mut b, bad.as_object().expect("obj")).is_err());
        assert_eq!(b.min_score, 75.0, "failed patch must not apply partially");

        let unknown = json!({ "passing": 75 });
        assert!(merge_bounds_patch(&mut b, unknown.as_object().expect("obj")).is_err());
    }
}
