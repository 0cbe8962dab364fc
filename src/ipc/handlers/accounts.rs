use crate::ipc::helpers::{
    count_where, delete_err, insert_err, new_id, now_rfc3339, optional_bool, optional_str,
    query_err, require_row, required_str, store_err, tx_err, update_err, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ranking::StudentRef;
use crate::store::{self, SqliteRepository};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

/// Deactivated students are left out, so they drop from rankings.
pub fn load_active_students(conn: &Connection) -> Result<Vec<StudentRef>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, class_id FROM students WHERE active = 1 ORDER BY name")
        .map_err(query_err)?;
    stmt.query_map([], |r| {
        Ok(StudentRef {
            id: r.get(0)?,
            name: r.get(1)?,
            class_id: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

/// `not_found` for an unknown id, `conflict` for a deactivated student.
pub fn require_active_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let active: Option<i64> = conn
        .query_row(
            "SELECT active FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    match active {
        None => Err(HandlerErr::not_found("student")),
        Some(0) => Err(HandlerErr::new("conflict", "student is inactive")
            .with_details(json!({ "studentId": student_id }))),
        Some(_) => Ok(()),
    }
}

fn ensure_nis_free(conn: &Connection, nis: &str, except_id: Option<&str>) -> Result<(), HandlerErr> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE nis = ? AND id <> ?",
            (nis, except_id.unwrap_or("")),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    match taken {
        Some(other) => Err(HandlerErr::new("conflict", format!("NIS {} is already registered", nis))
            .with_details(json!({ "field": "nis", "studentId": other }))),
        None => Ok(()),
    }
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = optional_str(params, "classId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.nis, s.name, s.class_id, c.name, s.active
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE (?1 IS NULL OR s.class_id = ?1)
             ORDER BY c.name, s.name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let nis: String = r.get(1)?;
            let name: String = r.get(2)?;
            let class_id: Option<String> = r.get(3)?;
            let class_name: Option<String> = r.get(4)?;
            let active: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "nis": nis,
                "name": name,
                "classId": class_id,
                "className": class_name,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let nis = required_str(params, "nis")?;
    let name = required_str(params, "name")?;
    let class_id = required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class")?;
    ensure_nis_free(conn, &nis, None)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, nis, name, class_id, active, created_at) VALUES(?, ?, ?, ?, 1, ?)",
        (&id, &nis, &name, &class_id, now_rfc3339()),
    )
    .map_err(insert_err("students"))?;
    Ok(json!({ "studentId": id, "nis": nis, "name": name }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "studentId")?;
    require_row(conn, "students", &id, "student")?;

    let nis = optional_str(params, "nis")?;
    let name = optional_str(params, "name")?;
    let class_id = optional_str(params, "classId")?;
    let active = optional_bool(params, "active")?;
    if let Some(n) = nis.as_deref() {
        ensure_nis_free(conn, n, Some(&id))?;
    }
    if let Some(c) = class_id.as_deref() {
        require_row(conn, "classes", c, "class")?;
    }

    conn.execute(
        "UPDATE students SET
           nis = COALESCE(?, nis),
           name = COALESCE(?, name),
           class_id = COALESCE(?, class_id),
           active = COALESCE(?, active),
           updated_at = ?
         WHERE id = ?",
        (
            &nis,
            &name,
            &class_id,
            active.map(i64::from),
            now_rfc3339(),
            &id,
        ),
    )
    .map_err(update_err)?;
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "studentId")?;
    require_row(conn, "students", &id, "student")?;

    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    let removed = tx
        .execute("DELETE FROM grade_entries WHERE student_id = ?", [&id])
        .map_err(delete_err("grade_entries"))?;
    store::delete_records(&SqliteRepository::new(&tx), &id).map_err(store_err)?;
    tx.execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(delete_err("students"))?;
    tx.commit().map_err(tx_err)?;

    tracing::info!(student_id = %id, entries = removed, "student deleted");
    Ok(json!({ "ok": true, "removedEntries": removed }))
}

fn admins_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, username, name, created_at FROM admins ORDER BY username")
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let username: String = r.get(1)?;
            let name: String = r.get(2)?;
            let created_at: String = r.get(3)?;
            Ok(json!({
                "id": id,
                "username": username,
                "name": name,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "admins": rows }))
}

fn admins_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let username = required_str(params, "username")?.to_lowercase();
    let name = required_str(params, "name")?;
    if username.chars().any(char::is_whitespace) {
        return Err(HandlerErr::bad_params("username must not contain whitespace"));
    }
    let taken = count_where(conn, "SELECT COUNT(*) FROM admins WHERE username = ?", &username)?;
    if taken > 0 {
        return Err(HandlerErr::new("conflict", format!("username {} is taken", username))
            .with_details(json!({ "field": "username" })));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO admins(id, username, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, &username, &name, now_rfc3339()),
    )
    .map_err(insert_err("admins"))?;
    Ok(json!({ "adminId": id, "username": username }))
}

fn admins_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "adminId")?;
    require_row(conn, "admins", &id, "admin")?;
    if let Some(name) = optional_str(params, "name")? {
        conn.execute("UPDATE admins SET name = ? WHERE id = ?", (&name, &id))
            .map_err(update_err)?;
    }
    Ok(json!({ "ok": true }))
}

fn admins_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "adminId")?;
    require_row(conn, "admins", &id, "admin")?;
    let others = count_where(conn, "SELECT COUNT(*) FROM admins WHERE id <> ?", &id)?;
    if others == 0 {
        return Err(HandlerErr::new("conflict", "cannot remove the last admin"));
    }
    conn.execute("DELETE FROM admins WHERE id = ?", [&id])
        .map_err(delete_err("admins"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.delete" => Some(with_db(state, req, students_delete)),
        "admins.list" => Some(with_db(state, req, |conn, _| admins_list(conn))),
        "admins.create" => Some(with_db(state, req, admins_create)),
        "admins.update" => Some(with_db(state, req, admins_update)),
        "admins.delete" => Some(with_db(state, req, admins_delete)),
        _ => None,
    }
}
