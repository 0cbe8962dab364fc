use crate::calc::SubjectRecord;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};

/// Key/value persistence for JSON documents. The grading functions never see
/// this; handlers load through it and pass plain data down.
pub trait Repository {
    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;
    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

pub struct SqliteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Repository for SqliteRepository<'_> {
    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value_json FROM kv_store WHERE key = ?", [key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(text) => Ok(Some(
                serde_json::from_str(&text)
                    .with_context(|| format!("stored value for {} is not valid JSON", key))?,
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO kv_store(key, value_json, updated_at) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            (key, &text, chrono::Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM kv_store WHERE key = ?", [key])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryRepository {
    entries: std::cell::RefCell<std::collections::BTreeMap<String, serde_json::Value>>,
}

#[cfg(test)]
impl Repository for MemoryRepository {
    fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.borrow_mut().remove(key).is_some())
    }
}

pub fn records_key(student_id: &str) -> String {
    format!("records/{}", student_id)
}

pub fn settings_key(section: &str) -> String {
    format!("settings/{}", section)
}

pub fn load_records(repo: &dyn Repository, student_id: &str) -> anyhow::Result<Vec<SubjectRecord>> {
    match repo.get(&records_key(student_id))? {
        Some(v) => serde_json::from_value(v)
            .with_context(|| format!("stored records for {} are malformed", student_id)),
        None => Ok(Vec::new()),
    }
}

pub fn save_records(
    repo: &dyn Repository,
    student_id: &str,
    records: &[SubjectRecord],
) -> anyhow::Result<()> {
    repo.set(&records_key(student_id), &serde_json::to_value(records)?)
}

pub fn delete_records(repo: &dyn Repository, student_id: &str) -> anyhow::Result<bool> {
    repo.delete(&records_key(student_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{overall_average, Score, Semester};

    fn exercise(repo: &dyn Repository) {
        assert_eq!(repo.get("missing").expect("get"), None);
        repo.set("k", &serde_json::json!({ "a": 1 })).expect("set");
        assert_eq!(repo.get("k").expect("get"), Some(serde_json::json!({ "a": 1 })));
        repo.set("k", &serde_json::json!([1, 2])).expect("overwrite");
        assert_eq!(repo.get("k").expect("get"), Some(serde_json::json!([1, 2])));
        assert!(repo.delete("k").expect("delete"));
        assert!(!repo.delete("k").expect("delete again"));
    }

    #[test]
    fn memory_repository_get_set_delete() {
        exercise(&MemoryRepository::default());
    }

    #[test]
    fn sqlite_repository_get_set_delete() {
        let conn = Connection::open_in_memory().expect("open");
        crate::db::create_schema(&conn).expect("schema");
        exercise(&SqliteRepository::new(&conn));
    }

    #[test]
    fn records_survive_a_save_load_cycle() {
        let repo = MemoryRepository::default();
        assert!(load_records(&repo, "s1").expect("load").is_empty());

        let mut math = SubjectRecord::new("math", "Mathematics");
        math.set_score(Semester::new(1).expect("semester"), Some(Score::new(81.5).expect("score")));
        math.set_score(Semester::new(3).expect("semester"), Some(Score::new(90.0).expect("score")));
        save_records(&repo, "s1", &[math.clone()]).expect("save");

        let loaded = load_records(&repo, "s1").expect("load");
        assert_eq!(loaded, vec![math]);
        assert_eq!(overall_average(&loaded), 85.75);
        assert!(delete_records(&repo, "s1").expect("delete"));
    }

    #[test]
    fn malformed_records_are_an_error() {
        let repo = MemoryRepository::default();
        repo.set(&records_key("s1"), &serde_json::json!([{ "subjectId": "m", "name": "M", "scores": [101, null, null, null, null] }]))
            .expect("set");
        assert!(load_records(&repo, "s1").is_err());
    }
}
