use crate::calc::{self, Score, Semester, SubjectRecord, SEMESTER_COUNT};
use crate::ipc::handlers::settings::grading_policy;
use crate::ipc::helpers::{
    nullable_score, optional_i64, query_err, require_row, required_semester, required_str,
    store_err, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, SqliteRepository};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

/// Wire shape of a record before its scores are validated.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    subject_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    scores: Vec<Option<f64>>,
}

fn load(conn: &Connection, student_id: &str) -> Result<Vec<SubjectRecord>, HandlerErr> {
    require_row(conn, "students", student_id, "student")?;
    store::load_records(&SqliteRepository::new(conn), student_id).map_err(store_err)
}

fn save(conn: &Connection, student_id: &str, records: &[SubjectRecord]) -> Result<(), HandlerErr> {
    store::save_records(&SqliteRepository::new(conn), student_id, records)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{:#}", e)))
}

/// Semesters from params, else the site's active semesters.
fn requested_semesters(conn: &Connection, params: &Value) -> Result<Vec<Semester>, HandlerErr> {
    match params.get("semesters") {
        None | Some(Value::Null) => Ok(grading_policy(conn)?.active_semesters),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| -> Result<Semester, HandlerErr> {
                let n = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("semesters must contain integers"))?;
                Ok(Semester::new(n)?)
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params("semesters must be an array")),
    }
}

fn records_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let records = load(conn, &student_id)?;
    Ok(json!({ "studentId": student_id, "records": records }))
}

fn records_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let raw = params
        .get("records")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing records"))?;
    let raw: Vec<RawRecord> = serde_json::from_value(raw)
        .map_err(|e| HandlerErr::bad_params(format!("records rejected: {}", e)))?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for r in raw {
        let subject_id = r.subject_id.trim().to_string();
        if subject_id.is_empty() {
            return Err(HandlerErr::bad_params("subjectId must not be empty"));
        }
        if !seen.insert(subject_id.clone()) {
            return Err(HandlerErr::bad_params(format!(
                "subject {} appears twice",
                subject_id
            )));
        }
        if r.scores.len() > SEMESTER_COUNT {
            return Err(HandlerErr::bad_params(format!(
                "subject {} has more than {} semesters",
                subject_id, SEMESTER_COUNT
            )));
        }
        let mut record = SubjectRecord::new(subject_id, r.name.trim());
        for (i, v) in r.scores.into_iter().enumerate() {
            let score = v.map(Score::new).transpose().map_err(|e| {
                HandlerErr::from(e)
                    .with_details(json!({ "subjectId": record.subject_id, "semester": i + 1 }))
            })?;
            record.scores[i] = score;
        }
        records.push(record);
    }

    save(conn, &student_id, &records)?;
    Ok(json!({ "ok": true, "count": records.len() }))
}

fn subject_name(conn: &Connection, subject_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(query_err)
}

fn records_set_score(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let semester = required_semester(params, "semester")?;
    let score = nullable_score(params, "value")?;

    let mut records = load(conn, &student_id)?;
    let idx = match records.iter().position(|r| r.subject_id == subject_id) {
        Some(i) => i,
        None => {
            let name = match params.get("name").and_then(|v| v.as_str()) {
                Some(n) if !n.trim().is_empty() => n.trim().to_string(),
                _ => subject_name(conn, &subject_id)?.unwrap_or_else(|| subject_id.clone()),
            };
            records.push(SubjectRecord::new(subject_id.clone(), name));
            records.len() - 1
        }
    };
    records[idx].set_score(semester, score);
    save(conn, &student_id, &records)?;

    let all = Semester::all();
    let record = &records[idx];
    Ok(json!({
        "record": record,
        "average": calc::round_off_2_decimal(calc::subject_average(record, &all)),
        "hasData": calc::subject_has_data(record, &all),
        "overallAverage": calc::round_off_2_decimal(calc::overall_average(&records))
    }))
}

fn records_remove_subject(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let mut records = load(conn, &student_id)?;
    let before = records.len();
    records.retain(|r| r.subject_id != subject_id);
    if records.len() == before {
        return Err(HandlerErr::not_found("subject record"));
    }
    save(conn, &student_id, &records)?;
    Ok(json!({ "ok": true, "count": records.len() }))
}

fn records_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let records = load(conn, &student_id)?;
    let semesters = requested_semesters(conn, params)?;
    let summary = calc::summarize(&records, &semesters);
    let mut out = serde_json::to_value(&summary)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    out["studentId"] = json!(student_id);
    if let Some(top) = optional_i64(params, "top")? {
        let mut ranked: Vec<&calc::SubjectSummary> =
            summary.subjects.iter().filter(|s| s.has_data).collect();
        ranked.sort_by(|a, b| {
            b.average
                .partial_cmp(&a.average)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let ids: Vec<&str> = ranked
            .iter()
            .take(top.max(0) as usize)
            .map(|s| s.subject_id.as_str())
            .collect();
        out["topSubjects"] = json!(ids);
    }
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "records.get" => Some(with_db(state, req, records_get)),
        "records.save" => Some(with_db(state, req, records_save)),
        "records.setScore" => Some(with_db(state, req, records_set_score)),
        "records.removeSubject" => Some(with_db(state, req, records_remove_subject)),
        "records.summary" => Some(with_db(state, req, records_summary)),
        _ => None,
    }
}
