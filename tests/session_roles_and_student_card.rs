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
fn bootstrap_admin_then_role_gated_administration() {
    let workspace = temp_dir("schoold-session-roles");
    let mut sc = Sidecar::spawn();
    let _ = sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));

    assert_eq!(sc.err_code("sections.list", json!({})), "no_session");
    // The first account has to be an admin.
    assert_eq!(
        sc.err_code(
            "accounts.create",
            json!({ "email": "t@school.test", "role": "teacher", "displayName": "T" }),
        ),
        "bad_params"
    );
    let _ = sc.ok(
        "accounts.create",
        json!({ "email": "Registrar@School.test", "role": "admin", "displayName": "Registrar" }),
    );
    // Bootstrap is over; further accounts need an admin session.
    assert_eq!(
        sc.err_code(
            "accounts.create",
            json!({ "email": "t@school.test", "role": "teacher", "displayName": "T" }),
        ),
        "no_session"
    );
    assert_eq!(
        sc.err_code("session.open", json!({ "email": "nobody@school.test" })),
        "not_found"
    );

    let opened = sc.ok("session.open", json!({ "email": " registrar@school.TEST " }));
    assert_eq!(opened["role"], "admin");
    let health = sc.ok("health", json!({}));
    assert_eq!(health["session"]["role"], "admin");

    let _ = sc.ok(
        "accounts.create",
        json!({ "email": "santos@school.test", "role": "teacher", "displayName": "Mr. Santos" }),
    );
    assert_eq!(
        sc.err_code(
            "accounts.create",
            json!({ "email": "SANTOS@school.test", "role": "teacher", "displayName": "Dup" }),
        ),
        "conflict"
    );
    let teachers = sc.ok("accounts.list", json!({ "role": "teacher" }));
    assert_eq!(teachers["accounts"].as_array().map(|a| a.len()), Some(1));

    let _ = sc.ok("session.open", json!({ "email": "santos@school.test" }));
    assert_eq!(sc.err_code("sections.create", json!({ "name": "X" })), "forbidden");
    assert_eq!(sc.err_code("accounts.list", json!({})), "forbidden");
    let _ = sc.ok("sections.list", json!({}));

    let _ = sc.ok("session.close", json!({}));
    let current = sc.ok("session.get", json!({}));
    assert!(current["session"].is_null());

    // Switching workspaces drops the session.
    let _ = sc.ok("session.open", json!({ "email": "santos@school.test" }));
    let _ = sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(sc.err_code("sections.list", json!({})), "no_session");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_card_reports_general_average_and_is_self_only() {
    let workspace = temp_dir("schoold-student-card");
    let mut sc = Sidecar::spawn();
    let _ = sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let _ = sc.ok(
        "accounts.create",
        json!({ "email": "registrar@school.test", "role": "admin", "displayName": "Registrar" }),
    );
    let _ = sc.ok("session.open", json!({ "email": "registrar@school.test" }));
    let teacher = sc.ok(
        "accounts.create",
        json!({ "email": "santos@school.test", "role": "teacher", "displayName": "Mr. Santos" }),
    );
    let teacher_id = str_field(&teacher, "accountId");
    let section = sc.ok("sections.create", json!({ "name": "Rizal" }));
    let section_id = str_field(&section, "sectionId");

    let mut students = Vec::new();
    for (last, first) in [("Reyes", "Lia"), ("Luna", "Juan")] {
        let s = sc.ok(
            "students.create",
            json!({ "lastName": last, "firstName": first }),
        );
        let sid = str_field(&s, "studentId");
        let _ = sc.ok(
            "enrollments.set",
            json!({ "studentId": sid, "sectionId": section_id, "schoolYear": "2024-2025", "semester": "1st" }),
        );
        students.push(sid);
    }
    let lia = students[0].clone();
    let juan = students[1].clone();

    // Re-enrolling in the same section is idempotent; another section conflicts.
    let again = sc.ok(
        "enrollments.set",
        json!({ "studentId": lia, "sectionId": section_id, "schoolYear": "2024-2025", "semester": "1st" }),
    );
    assert_eq!(again["created"], false);
    let other = sc.ok("sections.create", json!({ "name": "Mabini" }));
    let other_id = str_field(&other, "sectionId");
    assert_eq!(
        sc.err_code(
            "enrollments.set",
            json!({ "studentId": lia, "sectionId": other_id, "schoolYear": "2024-2025", "semester": "1st" }),
        ),
        "conflict"
    );

    let roster = sc.ok(
        "students.list",
        json!({ "sectionId": section_id, "schoolYear": "2024-2025", "semester": "1st" }),
    );
    let names: Vec<String> = roster["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| str_field(s, "displayName"))
        .collect();
    assert_eq!(names, vec!["Luna, Juan".to_string(), "Reyes, Lia".to_string()]);

    let mut offerings = Vec::new();
    for subject in ["Mathematics", "Science", "History"] {
        let o = sc.ok(
            "offerings.create",
            json!({
                "subjectName": subject,
                "sectionId": section_id,
                "schoolYear": "2024-2025",
                "semester": "1st",
                "teacherId": teacher_id
            }),
        );
        offerings.push(str_field(&o, "offeringId"));
    }
    // Lia: 98 and 99 finalized, History first quarter only.
    for (offering, q1, q2) in [(&offerings[0], 97.0, 99.0), (&offerings[1], 99.0, 99.0)] {
        let _ = sc.ok(
            "grades.record",
            json!({ "offeringId": offering, "studentId": lia, "quarter": 1, "score": q1 }),
        );
        let _ = sc.ok(
            "grades.record",
            json!({ "offeringId": offering, "studentId": lia, "quarter": 2, "score": q2 }),
        );
    }
    let _ = sc.ok(
        "grades.record",
        json!({ "offeringId": offerings[2], "studentId": lia, "quarter": 1, "score": 80 }),
    );

    let student_account = sc.ok(
        "accounts.create",
        json!({ "email": "lia@school.test", "role": "student", "displayName": "Lia Reyes", "studentId": lia }),
    );
    assert_eq!(student_account["role"], "student");
    assert_eq!(
        sc.err_code(
            "accounts.create",
            json!({ "email": "lia2@school.test", "role": "student", "displayName": "Lia", "studentId": lia }),
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "accounts.create",
            json!({ "email": "x@school.test", "role": "student", "displayName": "X" }),
        ),
        "bad_params"
    );

    let opened = sc.ok("session.open", json!({ "email": "lia@school.test" }));
    assert_eq!(opened["studentId"], lia.as_str());

    let card = sc.ok(
        "reports.studentCard",
        json!({ "studentId": lia, "schoolYear": "2024-2025", "semester": "1st" }),
    );
    assert_eq!(card["displayName"], "Reyes, Lia");
    assert_eq!(card["scope"]["sectionId"], section_id.as_str());
    let subjects = card["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 3);
    assert_eq!(subjects[0]["subjectName"], "History");
    assert!(subjects[0]["finalGrade"].is_null());
    assert_eq!(subjects[1]["subjectName"], "Mathematics");
    assert_eq!(subjects[1]["finalGrade"].as_f64(), Some(98.0));
    assert_eq!(subjects[1]["distinction"], "With Highest Honors");
    assert_eq!(card["generalAverage"].as_f64(), Some(98.5));
    assert_eq!(card["subjectCount"].as_u64(), Some(2));
    assert_eq!(card["distinction"], "With Highest Honors");

    assert_eq!(
        sc.err_code(
            "reports.studentCard",
            json!({ "studentId": juan, "schoolYear": "2024-2025", "semester": "1st" }),
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code(
            "honors.sectionRoll",
            json!({ "sectionId": section_id, "schoolYear": "2024-2025", "semester": "1st" }),
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code(
            "reports.studentCard",
            json!({ "studentId": lia, "schoolYear": "2025-2026", "semester": "1st" }),
        ),
        "not_found"
    );

    let _ = sc.ok("session.open", json!({ "email": "santos@school.test" }));
    let juan_card = sc.ok(
        "reports.studentCard",
        json!({ "studentId": juan, "schoolYear": "2024-2025", "semester": "1st" }),
    );
    assert!(juan_card["generalAverage"].is_null());
    assert_eq!(juan_card["subjectCount"].as_u64(), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}
