use crate::ipc::helpers::{
    count_where, delete_err, insert_err, new_id, optional_bool, optional_i64, optional_str,
    query_err, require_row, required_str, tx_err, update_err, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ranking::{ClassRef, NamedRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

/// Reference tables that share the `id, name, code, sort_order` shape.
#[derive(Clone, Copy)]
pub enum RefKind {
    Level,
    Major,
    Subject,
}

impl RefKind {
    fn table(self) -> &'static str {
        match self {
            Self::Level => "levels",
            Self::Major => "majors",
            Self::Subject => "subjects",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Major => "major",
            Self::Subject => "subject",
        }
    }

    /// Correlated count of rows that reference a record, and the key it is reported under.
    fn usage(self) -> (&'static str, &'static str) {
        match self {
            Self::Level => (
                "(SELECT COUNT(*) FROM classes c WHERE c.level_id = t.id)",
                "classCount",
            ),
            Self::Major => (
                "(SELECT COUNT(*) FROM classes c WHERE c.major_id = t.id)",
                "classCount",
            ),
            Self::Subject => (
                "(SELECT COUNT(*) FROM grade_entries g WHERE g.subject_id = t.id)",
                "entryCount",
            ),
        }
    }
}

pub fn load_refs(conn: &Connection, kind: RefKind) -> Result<Vec<NamedRef>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, name FROM {} ORDER BY sort_order, name",
            kind.table()
        ))
        .map_err(query_err)?;
    stmt.query_map([], |r| {
        Ok(NamedRef {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

pub fn load_classes(conn: &Connection) -> Result<Vec<ClassRef>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, level_id, major_id FROM classes ORDER BY name")
        .map_err(query_err)?;
    stmt.query_map([], |r| {
        Ok(ClassRef {
            id: r.get(0)?,
            name: r.get(1)?,
            level_id: r.get(2)?,
            major_id: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

fn name_taken(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &str,
    except_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT 1 FROM {} WHERE lower({}) = lower(?) AND id <> ?",
            table, column
        ),
        (value, except_id.unwrap_or("")),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(query_err)
}

fn ensure_name_free(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &str,
    except_id: Option<&str>,
) -> Result<(), HandlerErr> {
    if name_taken(conn, table, column, value, except_id)? {
        return Err(HandlerErr::new("conflict", format!("{} already exists", value))
            .with_details(json!({ "field": column })));
    }
    Ok(())
}

fn refs_list(conn: &Connection, kind: RefKind) -> Result<Value, HandlerErr> {
    let (usage_sql, usage_key) = kind.usage();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT t.id, t.name, t.code, t.sort_order, {} FROM {} t ORDER BY t.sort_order, t.name",
            usage_sql,
            kind.table()
        ))
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            let usage: i64 = r.get(4)?;
            let mut row = json!({
                "id": id,
                "name": name,
                "code": code,
                "sortOrder": sort_order,
            });
            row[usage_key] = json!(usage);
            Ok(row)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "items": rows }))
}

fn refs_create(conn: &Connection, kind: RefKind, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let code = optional_str(params, "code")?;
    ensure_name_free(conn, kind.table(), "name", &name, None)?;

    let sort_order = match optional_i64(params, "sortOrder")? {
        Some(n) => n,
        None => conn
            .query_row(
                &format!("SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {}", kind.table()),
                [],
                |r| r.get(0),
            )
            .map_err(query_err)?,
    };

    let id = new_id();
    conn.execute(
        &format!(
            "INSERT INTO {}(id, name, code, sort_order) VALUES(?, ?, ?, ?)",
            kind.table()
        ),
        (&id, &name, &code, sort_order),
    )
    .map_err(insert_err(kind.table()))?;
    Ok(json!({ "id": id, "name": name, "code": code, "sortOrder": sort_order }))
}

fn refs_update(conn: &Connection, kind: RefKind, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, kind.table(), &id, kind.label())?;

    if let Some(name) = optional_str(params, "name")? {
        ensure_name_free(conn, kind.table(), "name", &name, Some(&id))?;
        conn.execute(
            &format!("UPDATE {} SET name = ? WHERE id = ?", kind.table()),
            (&name, &id),
        )
        .map_err(update_err)?;
    }
    if params.get("code").is_some() {
        let code = optional_str(params, "code")?;
        conn.execute(
            &format!("UPDATE {} SET code = ? WHERE id = ?", kind.table()),
            (&code, &id),
        )
        .map_err(update_err)?;
    }
    if let Some(sort_order) = optional_i64(params, "sortOrder")? {
        conn.execute(
            &format!("UPDATE {} SET sort_order = ? WHERE id = ?", kind.table()),
            (sort_order, &id),
        )
        .map_err(update_err)?;
    }
    Ok(json!({ "ok": true }))
}

fn refs_delete(conn: &Connection, kind: RefKind, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, kind.table(), &id, kind.label())?;

    match kind {
        RefKind::Level | RefKind::Major => {
            let column = if matches!(kind, RefKind::Level) {
                "level_id"
            } else {
                "major_id"
            };
            let in_use = count_where(
                conn,
                &format!("SELECT COUNT(*) FROM classes WHERE {} = ?", column),
                &id,
            )?;
            if in_use > 0 {
                return Err(HandlerErr::new(
                    "in_use",
                    format!("{} is used by {} class(es)", kind.label(), in_use),
                )
                .with_details(json!({ "classCount": in_use })));
            }
            conn.execute(&format!("DELETE FROM {} WHERE id = ?", kind.table()), [&id])
                .map_err(delete_err(kind.table()))?;
            Ok(json!({ "ok": true }))
        }
        RefKind::Subject => {
            let tx = conn.unchecked_transaction().map_err(tx_err)?;
            let removed = tx
                .execute("DELETE FROM grade_entries WHERE subject_id = ?", [&id])
                .map_err(delete_err("grade_entries"))?;
            tx.execute("DELETE FROM subjects WHERE id = ?", [&id])
                .map_err(delete_err("subjects"))?;
            tx.commit().map_err(tx_err)?;
            tracing::info!(subject_id = %id, entries = removed, "subject deleted");
            Ok(json!({ "ok": true, "removedEntries": removed }))
        }
    }
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let level_id = optional_str(params, "levelId")?;
    let major_id = optional_str(params, "majorId")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.level_id,
               l.name,
               c.major_id,
               m.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classes c
             JOIN levels l ON l.id = c.level_id
             LEFT JOIN majors m ON m.id = c.major_id
             WHERE (?1 IS NULL OR c.level_id = ?1)
               AND (?2 IS NULL OR c.major_id = ?2)
             ORDER BY l.sort_order, c.name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((&level_id, &major_id), |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let level_id: String = r.get(2)?;
            let level_name: String = r.get(3)?;
            let major_id: Option<String> = r.get(4)?;
            let major_name: Option<String> = r.get(5)?;
            let student_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "levelId": level_id,
                "levelName": level_name,
                "majorId": major_id,
                "majorName": major_name,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let level_id = required_str(params, "levelId")?;
    let major_id = optional_str(params, "majorId")?;
    require_row(conn, "levels", &level_id, "level")?;
    if let Some(m) = major_id.as_deref() {
        require_row(conn, "majors", m, "major")?;
    }
    ensure_name_free(conn, "classes", "name", &name, None)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO classes(id, name, level_id, major_id) VALUES(?, ?, ?, ?)",
        (&id, &name, &level_id, &major_id),
    )
    .map_err(insert_err("classes"))?;
    Ok(json!({ "classId": id, "name": name }))
}

fn classes_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "classId")?;
    require_row(conn, "classes", &id, "class")?;

    if let Some(name) = optional_str(params, "name")? {
        ensure_name_free(conn, "classes", "name", &name, Some(&id))?;
        conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &id))
            .map_err(update_err)?;
    }
    if let Some(level_id) = optional_str(params, "levelId")? {
        require_row(conn, "levels", &level_id, "level")?;
        conn.execute("UPDATE classes SET level_id = ? WHERE id = ?", (&level_id, &id))
            .map_err(update_err)?;
    }
    // An explicit null detaches the class from its major.
    if params.get("majorId").is_some() {
        let major_id = optional_str(params, "majorId")?;
        if let Some(m) = major_id.as_deref() {
            require_row(conn, "majors", m, "major")?;
        }
        conn.execute("UPDATE classes SET major_id = ? WHERE id = ?", (&major_id, &id))
            .map_err(update_err)?;
    }
    Ok(json!({ "ok": true }))
}

fn classes_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "classId")?;
    require_row(conn, "classes", &id, "class")?;
    let students = count_where(conn, "SELECT COUNT(*) FROM students WHERE class_id = ?", &id)?;
    if students > 0 {
        return Err(HandlerErr::new(
            "in_use",
            format!("class still has {} student(s)", students),
        )
        .with_details(json!({ "studentCount": students })));
    }
    conn.execute("DELETE FROM classes WHERE id = ?", [&id])
        .map_err(delete_err("classes"))?;
    Ok(json!({ "ok": true }))
}

fn years_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, label, active FROM academic_years ORDER BY label DESC")
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let label: String = r.get(1)?;
            let active: i64 = r.get(2)?;
            Ok(json!({ "id": id, "label": label, "active": active != 0 }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "years": rows }))
}

fn activate_year(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("UPDATE academic_years SET active = 0 WHERE active <> 0", [])
        .map_err(update_err)?;
    tx.execute("UPDATE academic_years SET active = 1 WHERE id = ?", [id])
        .map_err(update_err)?;
    tx.commit().map_err(tx_err)
}

fn years_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let label = required_str(params, "label")?;
    let active = optional_bool(params, "active")?.unwrap_or(false);
    ensure_name_free(conn, "academic_years", "label", &label, None)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO academic_years(id, label, active) VALUES(?, ?, 0)",
        (&id, &label),
    )
    .map_err(insert_err("academic_years"))?;
    if active {
        activate_year(conn, &id)?;
    }
    Ok(json!({ "id": id, "label": label, "active": active }))
}

fn years_activate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, "academic_years", &id, "academic year")?;
    activate_year(conn, &id)?;
    tracing::info!(year_id = %id, "academic year activated");
    Ok(json!({ "ok": true }))
}

fn years_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let active: Option<i64> = conn
        .query_row(
            "SELECT active FROM academic_years WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    match active {
        None => Err(HandlerErr::not_found("academic year")),
        Some(a) if a != 0 => Err(HandlerErr::new(
            "conflict",
            "cannot delete the active academic year",
        )),
        Some(_) => {
            conn.execute("DELETE FROM academic_years WHERE id = ?", [&id])
                .map_err(delete_err("academic_years"))?;
            Ok(json!({ "ok": true }))
        }
    }
}

fn ref_method(method: &str) -> Option<(RefKind, &str)> {
    let (family, action) = method.split_once('.')?;
    let kind = match family {
        "levels" => RefKind::Level,
        "majors" => RefKind::Major,
        "subjects" => RefKind::Subject,
        _ => return None,
    };
    Some((kind, action))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if let Some((kind, action)) = ref_method(&req.method) {
        return match action {
            "list" => Some(with_db(state, req, |conn, _| refs_list(conn, kind))),
            "create" => Some(with_db(state, req, |conn, p| refs_create(conn, kind, p))),
            "update" => Some(with_db(state, req, |conn, p| refs_update(conn, kind, p))),
            "delete" => Some(with_db(state, req, |conn, p| refs_delete(conn, kind, p))),
            _ => None,
        };
    }
    match req.method.as_str() {
        "classes.list" => Some(with_db(state, req, classes_list)),
        "classes.create" => Some(with_db(state, req, classes_create)),
        "classes.update" => Some(with_db(state, req, classes_update)),
        "classes.delete" => Some(with_db(state, req, classes_delete)),
        "years.list" => Some(with_db(state, req, |conn, _| years_list(conn))),
        "years.create" => Some(with_db(state, req, years_create)),
        "years.activate" => Some(with_db(state, req, years_activate)),
        "years.delete" => Some(with_db(state, req, years_delete)),
        _ => None,
    }
}
