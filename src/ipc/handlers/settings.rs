use crate::calc::Semester;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{store_err, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{settings_key, Repository, SqliteRepository};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

#[derive(Clone, Copy)]
enum Section {
    Site,
    Grading,
    Ranking,
}

const SECTIONS: [Section; 3] = [Section::Site, Section::Grading, Section::Ranking];

impl Section {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "site" => Some(Self::Site),
            "grading" => Some(Self::Grading),
            "ranking" => Some(Self::Ranking),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Grading => "grading",
            Self::Ranking => "ranking",
        }
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Site => json!({
            "schoolName": "BananasEdu",
            "portalTitle": "Report Card Portal",
            "announcement": "",
            "contactEmail": ""
        }),
        Section::Grading => json!({
            "activeSemesters": [1, 2, 3, 4, 5],
            "requireValidation": true,
            "allowResubmit": true
        }),
        Section::Ranking => json!({
            "defaultLimit": 50,
            "showRejected": false
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_semesters(v: &Value, key: &str) -> Result<Vec<i64>, String> {
    let items = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array", key))?;
    let mut seen = BTreeSet::new();
    for item in items {
        let n = item
            .as_i64()
            .ok_or_else(|| format!("{} must contain integers", key))?;
        Semester::new(n).map_err(|e| e.to_string())?;
        if !seen.insert(n) {
            return Err(format!("{} contains {} twice", key, n));
        }
    }
    if seen.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    Ok(seen.into_iter().collect())
}

fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        let parsed = match (section, k.as_str()) {
            (Section::Site, "schoolName") => {
                let s = parse_string_max(v, k, 120)?;
                if s.is_empty() {
                    return Err("schoolName must not be empty".to_string());
                }
                json!(s)
            }
            (Section::Site, "portalTitle") => json!(parse_string_max(v, k, 120)?),
            (Section::Site, "announcement") => json!(parse_string_max(v, k, 2000)?),
            (Section::Site, "contactEmail") => {
                let s = parse_string_max(v, k, 254)?;
                if !s.is_empty() && !s.contains('@') {
                    return Err("contactEmail must be an email address".to_string());
                }
                json!(s)
            }
            (Section::Grading, "activeSemesters") => json!(parse_semesters(v, k)?),
            (Section::Grading, "requireValidation") | (Section::Grading, "allowResubmit") => {
                json!(parse_bool(v, k)?)
            }
            (Section::Ranking, "defaultLimit") => json!(parse_i64_range(v, k, 1, 500)?),
            (Section::Ranking, "showRejected") => json!(parse_bool(v, k)?),
            _ => return Err(format!("unknown {} field: {}", section.name(), k)),
        };
        obj.insert(k.clone(), parsed);
    }
    Ok(())
}

fn load_section(conn: &Connection, section: Section) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    let repo = SqliteRepository::new(conn);
    if let Some(saved) = repo.get(&settings_key(section.name()))? {
        if let Some(saved_obj) = saved.as_object() {
            // Stale or hand-edited values must not lock the admin out of settings.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.name(), error = %e, "ignoring invalid saved settings");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

/// Settings other handlers depend on, already typed.
pub struct GradingPolicy {
    pub active_semesters: Vec<Semester>,
    pub require_validation: bool,
    pub allow_resubmit: bool,
}

pub fn grading_policy(conn: &Connection) -> Result<GradingPolicy, HandlerErr> {
    let grading = load_section(conn, Section::Grading).map_err(store_err)?;
    let active_semesters = grading["activeSemesters"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_i64())
                .filter_map(|n| Semester::new(n).ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(Semester::all);
    Ok(GradingPolicy {
        active_semesters,
        require_validation: grading["requireValidation"].as_bool().unwrap_or(true),
        allow_resubmit: grading["allowResubmit"].as_bool().unwrap_or(true),
    })
}

pub struct RankingPrefs {
    pub default_limit: usize,
    pub show_rejected: bool,
}

pub fn ranking_prefs(conn: &Connection) -> Result<RankingPrefs, HandlerErr> {
    let ranking = load_section(conn, Section::Ranking).map_err(store_err)?;
    Ok(RankingPrefs {
        default_limit: ranking["defaultLimit"].as_u64().unwrap_or(50) as usize,
        show_rejected: ranking["showRejected"].as_bool().unwrap_or(false),
    })
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut all = Map::new();
    for section in SECTIONS {
        match load_section(conn, section) {
            Ok(v) => {
                all.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", format!("{:#}", e), None),
        }
    }
    ok(&req.id, Value::Object(all))
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = Section::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{:#}", e), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    let repo = SqliteRepository::new(conn);
    if let Err(e) = repo.set(&settings_key(section.name()), &current) {
        return err(&req.id, "db_update_failed", format!("{:#}", e), None);
    }
    tracing::info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_semesters_are_sorted_and_validated() {
        let mut current = default_section(Section::Grading);
        let patch = json!({ "activeSemesters": [3, 1] });
        merge_section_patch(Section::Grading, &mut current, patch.as_object().expect("obj"))
            .expect("merge");
        assert_eq!(current["activeSemesters"], json!([1, 3]));

        for bad in [json!([]), json!([0]), json!([2, 2]), json!("1")] {
            let patch = json!({ "activeSemesters": bad });
            assert!(merge_section_patch(
                Section::Grading,
                &mut current,
                patch.as_object().expect("obj")
            )
            .is_err());
        }
    }

    #[test]
    fn unknown_fields_are_rejected_per_section() {
        let mut current = default_section(Section::Site);
        let patch = json!({ "defaultLimit": 10 });
        let e = merge_section_patch(Section::Site, &mut current, patch.as_object().expect("obj"))
            .expect_err("wrong section");
        assert!(e.contains("unknown site field"));
    }

    #[test]
    fn invalid_saved_section_falls_back_to_defaults() {
        let conn = Connection::open_in_memory().expect("open");
        crate::db::create_schema(&conn).expect("schema");
        SqliteRepository::new(&conn)
            .set(&settings_key("ranking"), &json!({ "defaultLimit": 0 }))
            .expect("seed");
        let prefs = ranking_prefs(&conn).ok().expect("prefs");
        assert_eq!(prefs.default_limit, 50);
        assert!(!prefs.show_rejected);

        SqliteRepository::new(&conn)
            .set(&settings_key("grading"), &json!({ "activeSemesters": [2, 4], "allowResubmit": false }))
            .expect("seed");
        let policy = grading_policy(&conn).ok().expect("policy");
        assert_eq!(policy.active_semesters.iter().map(|s| s.number()).collect::<Vec<_>>(), vec![2, 4]);
        assert!(!policy.allow_resubmit);
        assert!(policy.require_validation);
    }
}
