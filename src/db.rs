use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;

pub const DB_FILE_NAME: &str = "schoold.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade_level TEXT,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_no TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sex TEXT,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(last_name, first_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL CHECK(role IN ('admin', 'teacher', 'student')),
            display_name TEXT NOT NULL,
            student_id TEXT,
            created_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(student_id, school_year, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_scope
         ON enrollments(section_id, school_year, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_offerings(
            id TEXT PRIMARY KEY,
            subject_name TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            teacher_account_id TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(teacher_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_offerings_scope
         ON subject_offerings(section_id, school_year, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_grades(
            id TEXT PRIMARY KEY,
            offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            first_quarter REAL,
            second_quarter REAL,
            final_grade REAL,
            distinction TEXT,
            remarks TEXT,
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(offering_id, student_id)
        )",
        [],
    )?;
    ensure_subject_grades_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_grades_offering ON subject_grades(offering_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_grades_student ON subject_grades(student_id)",
        [],
    )?;

    // Older rows may carry a 0 final written before both quarters existed.
    migrate_premature_finals(&conn)?;

    Ok(conn)
}

fn ensure_subject_grades_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subject_grades", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE subject_grades ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn migrate_premature_finals(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE subject_grades
         SET final_grade = NULL, distinction = NULL
         WHERE final_grade IS NOT NULL
           AND (first_quarter IS NULL OR second_quarter IS NULL)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

/// A signed-in identity, resolved once per session from `accounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Admin {
        account_id: String,
        display_name: String,
    },
    Teacher {
        account_id: String,
        display_name: String,
    },
    Student {
        account_id: String,
        display_name: String,
        student_id: String,
    },
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Identity::Admin { .. } => Role::Admin,
            Identity::Teacher { .. } => Role::Teacher,
            Identity::Student { .. } => Role::Student,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Identity::Admin { account_id, .. }
            | Identity::Teacher { account_id, .. }
            | Identity::Student { account_id, .. } => account_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Identity::Admin {
                account_id,
                display_name,
            }
            | Identity::Teacher {
                account_id,
                display_name,
            } => json!({
                "accountId": account_id,
                "role": self.role().as_str(),
                "displayName": display_name,
                "studentId": null,
            }),
            Identity::Student {
                account_id,
                display_name,
                student_id,
            } => json!({
                "accountId": account_id,
                "role": self.role().as_str(),
                "displayName": display_name,
                "studentId": student_id,
            }),
        }
    }
}

pub fn normalize_email(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// Single lookup keyed on the unique email.
pub fn resolve_identity(conn: &Connection, email: &str) -> anyhow::Result<Option<Identity>> {
    let row: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, role, display_name, student_id FROM accounts WHERE email = ?",
            [normalize_email(email)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((account_id, role, display_name, student_id)) = row else {
        return Ok(None);
    };

    let identity = match Role::parse(&role) {
        Some(Role::Admin) => Identity::Admin {
            account_id,
            display_name,
        },
        Some(Role::Teacher) => Identity::Teacher {
            account_id,
            display_name,
        },
        Some(Role::Student) => {
            let Some(student_id) = student_id else {
                anyhow::bail!("student account {} has no linked student", account_id);
            };
            Identity::Student {
                account_id,
                display_name,
                student_id,
            }
        }
        None => anyhow::bail!("account {} has unknown role {}", account_id, role),
    };
    Ok(Some(identity))
}

pub fn account_count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))?)
}
