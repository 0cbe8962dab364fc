use crate::calc::{self, round_off_2_decimal};
use crate::grades::{EntryStatus, GradeEntry};
use crate::ipc::handlers::accounts::load_active_students;
use crate::ipc::handlers::master::{load_classes, load_refs, RefKind};
use crate::ipc::handlers::settings::ranking_prefs;
use crate::ipc::handlers::submissions::{query_entries, EntryQuery};
use crate::ipc::helpers::{optional_i64, optional_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ranking::{self, FilterOptions, FilterSelection, RankingFilter, Roster};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;

fn entries_with_status(conn: &Connection, status: EntryStatus) -> Result<Vec<GradeEntry>, HandlerErr> {
    Ok(query_entries(
        conn,
        &EntryQuery {
            status: Some(status),
            ..Default::default()
        },
    )?
    .into_iter()
    .map(|l| l.entry)
    .collect())
}

/// Rejected entries per student, under the same semester and subject filters.
fn rejected_counts(
    conn: &Connection,
    filter: &RankingFilter,
) -> Result<HashMap<String, usize>, HandlerErr> {
    let mut counts = HashMap::new();
    for e in entries_with_status(conn, EntryStatus::Rejected)? {
        if filter.semester.map(|s| s != e.semester).unwrap_or(false) {
            continue;
        }
        if filter.subject_id.as_ref().map(|s| *s != e.subject_id).unwrap_or(false) {
            continue;
        }
        *counts.entry(e.student_id).or_insert(0) += 1;
    }
    Ok(counts)
}

fn ranking_compute(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = ranking::parse_ranking_filter(params.get("filters")).map_err(HandlerErr::bad_params)?;
    let prefs = ranking_prefs(conn)?;
    let limit = match optional_i64(params, "limit")? {
        None => prefs.default_limit,
        Some(n) if (1..=500).contains(&n) => n as usize,
        Some(_) => return Err(HandlerErr::bad_params("limit must be in 1..=500")),
    };

    let entries = entries_with_status(conn, EntryStatus::Validated)?;
    let students = load_active_students(conn)?;
    let classes = load_classes(conn)?;
    let roster = Roster::new(&students, &classes);
    let ranked = ranking::rank_students(&entries, &roster, &filter);
    let total = ranked.len();

    let rejected = if prefs.show_rejected {
        Some(rejected_counts(conn, &filter)?)
    } else {
        None
    };
    let class_names: HashMap<&str, &str> = classes
        .iter()
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect();

    let rows: Vec<Value> = ranked
        .into_iter()
        .take(limit)
        .map(|r| {
            let mut row = json!({
                "rank": r.rank,
                "studentId": r.student_id,
                "studentName": r.student_name,
                "classId": r.class_id,
                "className": r.class_id.as_deref().and_then(|c| class_names.get(c)),
                "average": round_off_2_decimal(r.average),
                "entryCount": r.entry_count,
                "band": calc::band_for(r.average)
            });
            if let Some(counts) = rejected.as_ref() {
                row["rejectedCount"] = json!(counts.get(&r.student_id).copied().unwrap_or(0));
            }
            row
        })
        .collect();

    tracing::debug!(total, shown = rows.len(), "ranking computed");
    Ok(json!({ "filters": filter, "total": total, "rows": rows }))
}

/// `"ALL"` is the controls' way of saying no selection.
fn selected(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    Ok(optional_str(params, key)?.filter(|s| !s.eq_ignore_ascii_case("ALL")))
}

fn ranking_filter_options(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let levels = load_refs(conn, RefKind::Level)?;
    let majors = load_refs(conn, RefKind::Major)?;
    let classes = load_classes(conn)?;
    let options = FilterOptions::new(&majors, &classes);

    let level_id = selected(params, "levelId")?.filter(|l| levels.iter().any(|x| x.id == *l));
    let selection = FilterSelection::normalized(
        level_id,
        selected(params, "majorId")?,
        selected(params, "classId")?,
        &options,
    );
    let level = selection.level_id.as_deref();
    let major = selection.major_id.as_deref();
    Ok(json!({
        "selection": selection,
        "filters": selection.to_filter(),
        "levels": levels,
        "majors": options.majors(level),
        "classes": options.classes(level, major)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ranking.compute" => Some(with_db(state, req, ranking_compute)),
        "ranking.filterOptions" => Some(with_db(state, req, ranking_filter_options)),
        _ => None,
    }
}
