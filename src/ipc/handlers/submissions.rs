use crate::calc::{self, Score, Semester};
use crate::grades::{self, EntryStatus, GradeEntry};
use crate::ipc::handlers::accounts::require_active_student;
use crate::ipc::handlers::master::{load_refs, RefKind};
use crate::ipc::handlers::settings::grading_policy;
use crate::ipc::helpers::{
    insert_err, new_id, now_rfc3339, optional_semester, optional_str, query_err, require_row,
    required_score, required_semester, required_str, string_list, tx_err, update_err, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Optional constraints for listing entries; `None` leaves a dimension open.
#[derive(Debug, Default)]
pub struct EntryQuery {
    pub status: Option<EntryStatus>,
    pub student_id: Option<String>,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub semester: Option<Semester>,
}

pub struct ListedEntry {
    pub entry: GradeEntry,
    pub student_name: String,
    pub subject_name: String,
}

pub fn query_entries(conn: &Connection, q: &EntryQuery) -> Result<Vec<ListedEntry>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.student_id, g.subject_id, g.semester, g.value, g.status, g.note,
                    g.submitted_at, g.reviewed_at, s.name, sub.name
             FROM grade_entries g
             JOIN students s ON s.id = g.student_id
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE (?1 IS NULL OR g.status = ?1)
               AND (?2 IS NULL OR g.student_id = ?2)
               AND (?3 IS NULL OR s.class_id = ?3)
               AND (?4 IS NULL OR g.subject_id = ?4)
               AND (?5 IS NULL OR g.semester = ?5)
             ORDER BY g.submitted_at, g.id",
        )
        .map_err(query_err)?;

    #[allow(clippy::type_complexity)]
    let rows: Vec<(
        String,
        String,
        String,
        i64,
        f64,
        String,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
    )> = stmt
        .query_map(
            (
                q.status.map(EntryStatus::as_str),
                &q.student_id,
                &q.class_id,
                &q.subject_id,
                q.semester.map(i64::from),
            ),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    rows.into_iter()
        .map(
            |(id, student_id, subject_id, semester, value, status, note, submitted_at, reviewed_at, student_name, subject_name)|
             -> Result<ListedEntry, HandlerErr> {
                let status = EntryStatus::parse(&status).ok_or_else(|| {
                    HandlerErr::new("db_query_failed", format!("entry {} has unknown status {}", id, status))
                })?;
                Ok(ListedEntry {
                    entry: GradeEntry {
                        id,
                        student_id,
                        subject_id,
                        semester: Semester::new(semester)?,
                        value: Score::new(value)?,
                        status,
                        note,
                        submitted_at,
                        reviewed_at,
                    },
                    student_name,
                    subject_name,
                })
            },
        )
        .collect()
}

fn entry_status(conn: &Connection, entry_id: &str) -> Result<EntryStatus, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM grade_entries WHERE id = ?",
            [entry_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    let raw = raw.ok_or_else(|| HandlerErr::not_found("grade entry"))?;
    EntryStatus::parse(&raw).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("entry {} has unknown status {}", entry_id, raw))
    })
}

fn grades_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let semester = required_semester(params, "semester")?;
    let value = required_score(params, "value")?;
    require_active_student(conn, &student_id)?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    let policy = grading_policy(conn)?;

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM grade_entries
             WHERE student_id = ? AND subject_id = ? AND semester = ?",
            (&student_id, &subject_id, i64::from(semester)),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let current = match existing.as_ref() {
        Some((id, raw)) => Some(EntryStatus::parse(raw).ok_or_else(|| {
            HandlerErr::new("db_query_failed", format!("entry {} has unknown status {}", id, raw))
        })?),
        None => None,
    };

    let mut next = EntryStatus::submit(current, policy.allow_resubmit)?;
    if !policy.require_validation {
        next = next.validate()?;
    }
    let now = now_rfc3339();
    let reviewed_at = (next == EntryStatus::Validated).then(|| now.clone());

    let entry_id = match existing {
        Some((id, _)) => {
            conn.execute(
                "UPDATE grade_entries
                 SET value = ?, status = ?, note = NULL, submitted_at = ?, reviewed_at = ?
                 WHERE id = ?",
                (value.value(), next.as_str(), &now, &reviewed_at, &id),
            )
            .map_err(update_err)?;
            id
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO grade_entries(
                   id, student_id, subject_id, semester, value, status, note, submitted_at, reviewed_at
                 ) VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)",
                (
                    &id,
                    &student_id,
                    &subject_id,
                    i64::from(semester),
                    value.value(),
                    next.as_str(),
                    &now,
                    &reviewed_at,
                ),
            )
            .map_err(insert_err("grade_entries"))?;
            id
        }
    };

    tracing::info!(
        entry_id = %entry_id,
        student_id = %student_id,
        subject_id = %subject_id,
        semester = semester.number(),
        status = next.as_str(),
        "grade submitted"
    );
    Ok(json!({ "entryId": entry_id, "status": next }))
}

fn grades_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let status = match optional_str(params, "status")? {
        None => None,
        Some(s) => Some(
            EntryStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
    };
    let q = EntryQuery {
        status,
        student_id: optional_str(params, "studentId")?,
        class_id: optional_str(params, "classId")?,
        subject_id: optional_str(params, "subjectId")?,
        semester: optional_semester(params, "semester")?,
    };
    let rows: Vec<Value> = query_entries(conn, &q)?
        .into_iter()
        .map(|l| {
            let mut row = json!(l.entry);
            row["studentName"] = json!(l.student_name);
            row["subjectName"] = json!(l.subject_name);
            row["band"] = json!(calc::resolve_band(l.entry.value));
            row
        })
        .collect();
    Ok(json!({ "entries": rows }))
}

fn apply_review(
    conn: &Connection,
    entry_id: &str,
    next: EntryStatus,
    note: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE grade_entries SET status = ?, note = ?, reviewed_at = ? WHERE id = ?",
        (next.as_str(), note, now_rfc3339(), entry_id),
    )
    .map_err(update_err)?;
    tracing::info!(entry_id = %entry_id, status = next.as_str(), "grade reviewed");
    Ok(())
}

fn grades_validate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let entry_id = required_str(params, "entryId")?;
    let next = entry_status(conn, &entry_id)?.validate()?;
    apply_review(conn, &entry_id, next, None)?;
    Ok(json!({ "entryId": entry_id, "status": next }))
}

fn grades_reject(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let entry_id = required_str(params, "entryId")?;
    let note = params
        .get("note")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let next = entry_status(conn, &entry_id)?.reject(&note)?;
    apply_review(conn, &entry_id, next, Some(&note))?;
    Ok(json!({ "entryId": entry_id, "status": next, "note": note }))
}

/// All or nothing: one entry that cannot be validated rolls back the batch.
/// Repeated ids count once.
fn grades_validate_many(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut ids = string_list(params, "entryIds")?;
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    if ids.is_empty() {
        return Err(HandlerErr::bad_params("entryIds must not be empty"));
    }

    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    for id in &ids {
        let next = entry_status(&tx, id)
            .and_then(|s| s.validate().map_err(HandlerErr::from))
            .map_err(|e| e.with_details(json!({ "entryId": id })))?;
        apply_review(&tx, id, next, None)?;
    }
    tx.commit().map_err(tx_err)?;
    Ok(json!({ "validated": ids.len() }))
}

fn grades_report_card(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let semesters = grading_policy(conn)?.active_semesters;

    let entries: Vec<GradeEntry> = query_entries(
        conn,
        &EntryQuery {
            status: Some(EntryStatus::Validated),
            student_id: Some(student_id.clone()),
            ..Default::default()
        },
    )?
    .into_iter()
    .map(|l| l.entry)
    .collect();
    let subjects = load_refs(conn, RefKind::Subject)?;
    let records = grades::records_from_entries(&entries, &subjects);
    let summary = calc::summarize(&records, &semesters);

    let mut out = serde_json::to_value(&summary)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    out["studentId"] = json!(student_id);
    out["entryCount"] = json!(entries.len());
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.submit" => Some(with_db(state, req, grades_submit)),
        "grades.list" => Some(with_db(state, req, grades_list)),
        "grades.validate" => Some(with_db(state, req, grades_validate)),
        "grades.reject" => Some(with_db(state, req, grades_reject)),
        "grades.validateMany" => Some(with_db(state, req, grades_validate_many)),
        "grades.reportCard" => Some(with_db(state, req, grades_report_card)),
        _ => None,
    }
}
