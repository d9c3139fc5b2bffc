use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoold-router-smoke");
    let csv_out = workspace.join("exports").join("honors.csv");
    let mut sc = Sidecar::spawn();

    let health = sc.ok("health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert_eq!(
        sc.err_code("students.create", json!({ "lastName": "A", "firstName": "B" })),
        "no_workspace"
    );

    let _ = sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let _ = sc.ok(
        "accounts.create",
        json!({ "email": "admin@school.test", "role": "admin", "displayName": "Admin" }),
    );
    let _ = sc.ok("session.open", json!({ "email": "admin@school.test" }));
    let _ = sc.ok("session.get", json!({}));
    let _ = sc.ok("accounts.list", json!({}));
    let section = sc.ok("sections.create", json!({ "name": "Smoke" }));
    let section_id = str_field(&section, "sectionId");
    let _ = sc.ok("sections.list", json!({}));
    let scope = json!({ "sectionId": section_id, "schoolYear": "2024-2025", "semester": "1st" });
    let _ = sc.ok("students.list", scope.clone());
    let _ = sc.ok("offerings.list", json!({}));
    let _ = sc.ok("grading.config.get", json!({}));
    let _ = sc.ok("honors.sectionRoll", scope.clone());
    let mut export = scope.clone();
    export["outPath"] = json!(csv_out.to_string_lossy());
    let exported = sc.ok("honors.exportCsv", export);
    assert_eq!(exported["rowsExported"].as_u64(), Some(0));
    assert!(csv_out.is_file());

    let unknown = sc.request("classes.list", json!({}));
    assert_eq!(unknown["error"]["code"], "not_implemented");

    for method in [
        "grades.record",
        "grades.list",
        "enrollments.set",
        "offerings.create",
        "reports.studentCard",
        "grading.config.update",
        "session.close",
    ] {
        let resp = sc.request(method, json!({}));
        if resp["ok"] == false {
            assert_ne!(
                resp["error"]["code"], "not_implemented",
                "unexpected unknown method for {}",
                method
            );
        }
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_lines_get_bad_json_with_recovered_id() {
    let mut sc = Sidecar::spawn();
    writeln!(sc.stdin, "{{\"id\":\"x1\",\"params\":{{}}}}").expect("write");
    writeln!(sc.stdin, "not json at all").expect("write");
    sc.stdin.flush().expect("flush");

    let mut line = String::new();
    sc.reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(v["id"], "x1");
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"]["code"], "bad_json");

    line.clear();
    sc.reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(v["id"], "");
    assert_eq!(v["error"]["code"], "bad_json");

    // The loop keeps serving after bad input.
    let _ = sc.ok("health", json!({}));
}

#[test]
fn startup_workspace_flag_opens_workspace() {
    let workspace = temp_dir("schoold-startup-flag");
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .arg("--workspace")
        .arg(&workspace)
        .arg("--log")
        .arg("debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    writeln!(stdin, "{}", json!({ "id": "1", "method": "health", "params": {} })).expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(
        v["result"]["workspacePath"].as_str(),
        Some(&*workspace.to_string_lossy())
    );
    assert!(workspace.join("schoold.sqlite3").is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
