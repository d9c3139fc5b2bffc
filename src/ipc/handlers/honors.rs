use crate::calc::{self, CalcContext, HonorRollModel};
use crate::db::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, require_role};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn compute_roll(state: &AppState, req: &Request) -> Result<HonorRollModel, serde_json::Value> {
    let conn = db_conn(state, req)?;
    require_role(state, req, &[Role::Admin, Role::Teacher])?;
    let scope = calc::parse_scope(&req.params).map_err(|e| calc_err(req, e))?;
    calc::compute_scope_honor_roll(&CalcContext {
        conn,
        scope: &scope,
    })
    .map_err(|e| calc_err(req, e))
}

fn handle_honors_section_roll(state: &mut AppState, req: &Request) -> serde_json::Value {
    match compute_roll(state, req) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => e,
    }
}

fn roll_csv(model: &HonorRollModel) -> String {
    let mut csv = String::from("rank,student_id,student_name,sex,average,subject_count,distinction\n");
    for r in &model.records {
        csv.push_str(&format!(
            "{},{},{},{},{:.2},{},{}\n",
            r.rank,
            csv_quote(&r.student_id),
            csv_quote(&r.display_name),
            csv_quote(r.sex.as_deref().unwrap_or("")),
            r.average,
            r.subject_count,
            r.distinction.map(|d| d.label()).unwrap_or("")
        ));
    }
    csv
}

fn handle_honors_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let model = match compute_roll(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, roll_csv(&model)) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "rowsExported": model.records.len(),
            "path": out_path,
            "message": model.message
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "honors.sectionRoll" => Some(handle_honors_section_roll(state, req)),
        "honors.exportCsv" => Some(handle_honors_export_csv(state, req)),
        _ => None,
    }
}
