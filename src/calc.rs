use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const HONOR_ROLL_FLOOR: f64 = 90.0;
pub const NO_STUDENTS_MESSAGE: &str = "No students found for the selected criteria.";
pub const NO_SUBJECTS_MESSAGE: &str = "No subject records found for the selected criteria.";

/// Half-up rounding to a whole number: `Int(x + 0.5)`.
pub fn round_off_0_decimal(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Half-up rounding to 2 decimals: `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimal(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Final subject grade from the two quarter scores. No range checks here;
/// bounds are enforced where scores are recorded.
pub fn compute_final_grade(first_quarter: f64, second_quarter: f64) -> f64 {
    round_off_0_decimal((first_quarter + second_quarter) / 2.0)
}

/// Final grade only once both quarters are in; unset otherwise (never zero).
pub fn final_grade_for(first_quarter: Option<f64>, second_quarter: Option<f64>) -> Option<f64> {
    match (first_quarter, second_quarter) {
        (Some(q1), Some(q2)) => Some(compute_final_grade(q1, q2)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HonorDistinction {
    #[serde(rename = "With Highest Honors")]
    WithHighestHonors,
    #[serde(rename = "With High Honors")]
    WithHighHonors,
    #[serde(rename = "With Honors")]
    WithHonors,
}

impl HonorDistinction {
    pub fn label(self) -> &'static str {
        match self {
            HonorDistinction::WithHighestHonors => "With Highest Honors",
            HonorDistinction::WithHighHonors => "With High Honors",
            HonorDistinction::WithHonors => "With Honors",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim() {
            "With Highest Honors" => Some(HonorDistinction::WithHighestHonors),
            "With High Honors" => Some(HonorDistinction::WithHighHonors),
            "With Honors" => Some(HonorDistinction::WithHonors),
            _ => None,
        }
    }
}

/// Bands are lower-inclusive/upper-exclusive, except the top band which
/// includes 100. Anything else (including NaN and > 100) has no distinction.
pub fn honor_distinction(grade: f64) -> Option<HonorDistinction> {
    if (98.0..=100.0).contains(&grade) {
        Some(HonorDistinction::WithHighestHonors)
    } else if (95.0..98.0).contains(&grade) {
        Some(HonorDistinction::WithHighHonors)
    } else if (90.0..95.0).contains(&grade) {
        Some(HonorDistinction::WithHonors)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quarter {
    First,
    Second,
}

impl Quarter {
    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            1 => Some(Quarter::First),
            2 => Some(Quarter::Second),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrade {
    pub student_id: String,
    pub first_quarter: Option<f64>,
    pub second_quarter: Option<f64>,
    pub final_grade: Option<f64>,
    pub distinction: Option<HonorDistinction>,
    pub remarks: Option<String>,
}

impl SubjectGrade {
    pub fn new(student_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            first_quarter: None,
            second_quarter: None,
            final_grade: None,
            distinction: None,
            remarks: None,
        }
    }

    /// A zero or absent final means "not graded yet".
    pub fn is_finalized(&self) -> bool {
        self.final_grade.map(|v| v > 0.0).unwrap_or(false)
    }

    /// Overwrite one quarter in place and re-derive final + distinction.
    pub fn apply_quarter_score(&mut self, quarter: Quarter, score: Option<f64>) {
        match quarter {
            Quarter::First => self.first_quarter = score,
            Quarter::Second => self.second_quarter = score,
        }
        self.final_grade = final_grade_for(self.first_quarter, self.second_quarter);
        self.distinction = self.final_grade.and_then(honor_distinction);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectOffering {
    pub id: String,
    pub subject_name: String,
    pub section_id: String,
    pub school_year: String,
    pub semester: String,
    pub teacher_id: Option<String>,
    pub grades: Vec<SubjectGrade>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub sex: Option<String>,
    pub student_no: Option<String>,
}

impl RosterStudent {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralAverage {
    pub average: f64,
    pub subject_count: usize,
    pub distinction: Option<HonorDistinction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorRecord {
    pub rank: usize,
    pub student_id: String,
    pub display_name: String,
    pub last_name: String,
    pub first_name: String,
    pub sex: Option<String>,
    pub average: f64,
    pub subject_count: usize,
    pub distinction: Option<HonorDistinction>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FinalsTally {
    sum: f64,
    count: usize,
}

impl FinalsTally {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    /// The rounded mean drives classification, never the raw one.
    fn general_average(self) -> Option<GeneralAverage> {
        if self.count == 0 {
            return None;
        }
        let average = round_off_2_decimal(self.sum / (self.count as f64));
        Some(GeneralAverage {
            average,
            subject_count: self.count,
            distinction: honor_distinction(average),
        })
    }
}

fn tally_finals<'a, I>(offerings: I) -> HashMap<&'a str, FinalsTally>
where
    I: IntoIterator<Item = &'a SubjectOffering>,
{
    let mut by_student: HashMap<&'a str, FinalsTally> = HashMap::new();
    for offering in offerings {
        for g in &offering.grades {
            if !g.is_finalized() {
                continue;
            }
            if let Some(v) = g.final_grade {
                by_student.entry(g.student_id.as_str()).or_default().push(v);
            }
        }
    }
    by_student
}

/// Cross-subject average for one student; `None` when nothing is graded yet.
pub fn general_average<'a, I>(student_id: &str, offerings: I) -> Option<GeneralAverage>
where
    I: IntoIterator<Item = &'a SubjectOffering>,
{
    let mut tally = FinalsTally::default();
    for offering in offerings {
        for g in &offering.grades {
            if g.student_id != student_id || !g.is_finalized() {
                continue;
            }
            if let Some(v) = g.final_grade {
                tally.push(v);
            }
        }
    }
    tally.general_average()
}

/// Ranked honor roll for one scope. Students keep their input order among
/// equal averages (the sort is stable).
pub fn compute_section_honor_roll(
    students: &[RosterStudent],
    offerings: &[SubjectOffering],
) -> Vec<HonorRecord> {
    let tallies = tally_finals(offerings);

    let mut records: Vec<HonorRecord> = Vec::new();
    for s in students {
        let Some(avg) = tallies
            .get(s.id.as_str())
            .copied()
            .and_then(FinalsTally::general_average)
        else {
            continue;
        };
        if avg.average < HONOR_ROLL_FLOOR {
            continue;
        }
        records.push(HonorRecord {
            rank: 0,
            student_id: s.id.clone(),
            display_name: s.display_name(),
            last_name: s.last_name.clone(),
            first_name: s.first_name.clone(),
            sex: s.sex.clone(),
            average: avg.average,
            subject_count: avg.subject_count,
            distinction: avg.distinction,
        });
    }

    records.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
    });
    for (i, r) in records.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    records
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        CalcError::new("db_query_failed", e.to_string())
    }
}

/// The (section, school year, semester) triple bounding one computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub section_id: String,
    pub school_year: String,
    pub semester: String,
}

fn required_trimmed(params: &serde_json::Value, key: &str) -> Result<String, CalcError> {
    let Some(v) = params.get(key) else {
        return Err(CalcError::new("bad_params", format!("missing {}", key)));
    };
    let Some(s) = v.as_str() else {
        return Err(CalcError::new("bad_params", format!("{} must be a string", key)));
    };
    let t = s.trim();
    if t.is_empty() {
        return Err(CalcError::new("bad_params", format!("{} must not be empty", key)));
    }
    Ok(t.to_string())
}

pub fn parse_scope(params: &serde_json::Value) -> Result<Scope, CalcError> {
    Ok(Scope {
        section_id: required_trimmed(params, "sectionId")?,
        school_year: required_trimmed(params, "schoolYear")?,
        semester: required_trimmed(params, "semester")?,
    })
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub scope: &'a Scope,
}

/// Enrolled students of the scope, last name ascending. This order is the
/// tie-break the honor roll inherits.
pub fn load_scope_students(ctx: &CalcContext<'_>) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.sex, s.student_no
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.section_id = ? AND e.school_year = ? AND e.semester = ?
             ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE, s.id",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map(
            (
                &ctx.scope.section_id,
                &ctx.scope.school_year,
                &ctx.scope.semester,
            ),
            |r| {
                Ok(RosterStudent {
                    id: r.get(0)?,
                    last_name: r.get(1)?,
                    first_name: r.get(2)?,
                    sex: r.get(3)?,
                    student_no: r.get(4)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(rows)
}

pub fn load_scope_offerings(ctx: &CalcContext<'_>) -> Result<Vec<SubjectOffering>, CalcError> {
    let scope = ctx.scope;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, subject_name, teacher_account_id
             FROM subject_offerings
             WHERE section_id = ? AND school_year = ? AND semester = ?
             ORDER BY subject_name COLLATE NOCASE, id",
        )
        .map_err(CalcError::db)?;
    let mut offerings = stmt
        .query_map(
            (&scope.section_id, &scope.school_year, &scope.semester),
            |r| {
                Ok(SubjectOffering {
                    id: r.get(0)?,
                    subject_name: r.get(1)?,
                    section_id: scope.section_id.clone(),
                    school_year: scope.school_year.clone(),
                    semester: scope.semester.clone(),
                    teacher_id: r.get(2)?,
                    grades: Vec::new(),
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    if offerings.is_empty() {
        return Ok(offerings);
    }

    let mut grade_stmt = ctx
        .conn
        .prepare(
            "SELECT g.offering_id, g.student_id, g.first_quarter, g.second_quarter,
                    g.final_grade, g.distinction, g.remarks
             FROM subject_grades g
             JOIN subject_offerings o ON o.id = g.offering_id
             WHERE o.section_id = ? AND o.school_year = ? AND o.semester = ?
             ORDER BY g.offering_id, g.rowid",
        )
        .map_err(CalcError::db)?;
    let grade_rows = grade_stmt
        .query_map(
            (&scope.section_id, &scope.school_year, &scope.semester),
            |r| {
                let offering_id: String = r.get(0)?;
                let distinction: Option<String> = r.get(5)?;
                Ok((
                    offering_id,
                    SubjectGrade {
                        student_id: r.get(1)?,
                        first_quarter: r.get(2)?,
                        second_quarter: r.get(3)?,
                        final_grade: r.get(4)?,
                        distinction: distinction.as_deref().and_then(HonorDistinction::from_label),
                        remarks: r.get(6)?,
                    },
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let index: HashMap<String, usize> = offerings
        .iter()
        .enumerate()
        .map(|(i, o)| (o.id.clone(), i))
        .collect();
    for (offering_id, grade) in grade_rows {
        if let Some(&i) = index.get(&offering_id) {
            offerings[i].grades.push(grade);
        }
    }
    Ok(offerings)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorRollModel {
    pub scope: Scope,
    pub student_count: usize,
    pub offering_count: usize,
    pub records: Vec<HonorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn compute_scope_honor_roll(ctx: &CalcContext<'_>) -> Result<HonorRollModel, CalcError> {
    let section_exists: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM sections WHERE id = ?",
            [&ctx.scope.section_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    if section_exists.is_none() {
        return Err(CalcError::new("not_found", "section not found"));
    }

    let students = load_scope_students(ctx)?;
    let offerings = load_scope_offerings(ctx)?;

    let message = if students.is_empty() {
        Some(NO_STUDENTS_MESSAGE.to_string())
    } else if offerings.is_empty() {
        Some(NO_SUBJECTS_MESSAGE.to_string())
    } else {
        None
    };
    let records = if message.is_some() {
        Vec::new()
    } else {
        compute_section_honor_roll(&students, &offerings)
    };

    Ok(HonorRollModel {
        scope: ctx.scope.clone(),
        student_count: students.len(),
        offering_count: offerings.len(),
        records,
        message,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSubject {
    pub offering_id: String,
    pub subject_name: String,
    pub teacher_id: Option<String>,
    pub first_quarter: Option<f64>,
    pub second_quarter: Option<f64>,
    pub final_grade: Option<f64>,
    pub distinction: Option<HonorDistinction>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCard {
    pub student: RosterStudent,
    pub display_name: String,
    pub scope: Scope,
    pub subjects: Vec<CardSubject>,
    pub general_average: Option<f64>,
    pub subject_count: usize,
    pub distinction: Option<HonorDistinction>,
}

pub fn compute_student_card(
    conn: &Connection,
    student_id: &str,
    school_year: &str,
    semester: &str,
) -> Result<StudentCard, CalcError> {
    let student: Option<RosterStudent> = conn
        .query_row(
            "SELECT id, last_name, first_name, sex, student_no FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(RosterStudent {
                    id: r.get(0)?,
                    last_name: r.get(1)?,
                    first_name: r.get(2)?,
                    sex: r.get(3)?,
                    student_no: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(student) = student else {
        return Err(CalcError::new("not_found", "student not found"));
    };

    let section_id: Option<String> = conn
        .query_row(
            "SELECT section_id FROM enrollments
             WHERE student_id = ? AND school_year = ? AND semester = ?",
            (student_id, school_year, semester),
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(section_id) = section_id else {
        let mut e = CalcError::new(
            "not_found",
            "student is not enrolled for the selected school year and semester",
        );
        e.details = Some(serde_json::json!({
            "studentId": student_id,
            "schoolYear": school_year,
            "semester": semester
        }));
        return Err(e);
    };

    let scope = Scope {
        section_id,
        school_year: school_year.to_string(),
        semester: semester.to_string(),
    };
    let offerings = load_scope_offerings(&CalcContext {
        conn,
        scope: &scope,
    })?;

    let subjects = offerings
        .iter()
        .map(|o| {
            let g = o.grades.iter().find(|g| g.student_id == student_id);
            CardSubject {
                offering_id: o.id.clone(),
                subject_name: o.subject_name.clone(),
                teacher_id: o.teacher_id.clone(),
                first_quarter: g.and_then(|g| g.first_quarter),
                second_quarter: g.and_then(|g| g.second_quarter),
                final_grade: g.and_then(|g| g.final_grade),
                distinction: g.and_then(|g| g.distinction),
                remarks: g.and_then(|g| g.remarks.clone()),
            }
        })
        .collect::<Vec<_>>();

    let avg = general_average(student_id, &offerings);
    Ok(StudentCard {
        display_name: student.display_name(),
        student,
        scope,
        subjects,
        general_average: avg.map(|a| a.average),
        subject_count: avg.map(|a| a.subject_count).unwrap_or(0),
        distinction: avg.and_then(|a| a.distinction),
    })
}
