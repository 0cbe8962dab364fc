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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bananasd");
    let mut child = Command::new(exe)
        .env_remove("BANANASD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bananasd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn referenced_rows_cannot_be_deleted() {
    let workspace = temp_dir("bananas-master-guards");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let level = request_ok(&mut stdin, &mut reader, "1", "levels.create", json!({ "name": "XII", "code": "12" }));
    let level_id = level["id"].as_str().expect("level id").to_string();
    let dup = request(&mut stdin, &mut reader, "2", "levels.create", json!({ "name": "xii" }));
    assert_eq!(error_code(&dup), "conflict");

    let major = request_ok(&mut stdin, &mut reader, "3", "majors.create", json!({ "name": "Bahasa" }));
    let major_id = major["id"].as_str().expect("major id").to_string();
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "name": "XII-Bahasa", "levelId": level_id, "majorId": major_id }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();

    let level_busy = request(&mut stdin, &mut reader, "5", "levels.delete", json!({ "id": level_id }));
    assert_eq!(error_code(&level_busy), "in_use");
    assert_eq!(level_busy["error"]["details"]["classCount"], json!(1));
    let major_busy = request(&mut stdin, &mut reader, "6", "majors.delete", json!({ "id": major_id }));
    assert_eq!(error_code(&major_busy), "in_use");

    let levels = request_ok(&mut stdin, &mut reader, "7", "levels.list", json!({}));
    assert_eq!(levels["items"][0]["classCount"], json!(1));
    assert_eq!(levels["items"][0]["code"], json!("12"));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "nis": "5001", "name": "Eka", "classId": class_id }),
    );
    let student_id = student["studentId"].as_str().expect("student id").to_string();
    let nis_taken = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({ "nis": "5001", "name": "Fajar", "classId": class_id }),
    );
    assert_eq!(error_code(&nis_taken), "conflict");

    let class_busy = request(&mut stdin, &mut reader, "10", "classes.delete", json!({ "classId": class_id }));
    assert_eq!(error_code(&class_busy), "in_use");
    assert_eq!(class_busy["error"]["details"]["studentCount"], json!(1));

    // Detaching the major frees it.
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "classes.update",
        json!({ "classId": class_id, "majorId": null }),
    );
    request_ok(&mut stdin, &mut reader, "12", "majors.delete", json!({ "id": major_id }));
    let classes = request_ok(&mut stdin, &mut reader, "13", "classes.list", json!({ "levelId": level_id }));
    assert!(classes["classes"][0]["majorId"].is_null());
    assert_eq!(classes["classes"][0]["studentCount"], json!(1));

    let subject = request_ok(&mut stdin, &mut reader, "14", "subjects.create", json!({ "name": "Sejarah" }));
    let subject_id = subject["id"].as_str().expect("subject id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "grades.submit",
        json!({ "studentId": student_id, "subjectId": subject_id, "semester": 2, "value": 77.5 }),
    );
    let removed = request_ok(&mut stdin, &mut reader, "16", "subjects.delete", json!({ "id": subject_id }));
    assert_eq!(removed["removedEntries"], json!(1));

    let gone = request_ok(&mut stdin, &mut reader, "17", "students.delete", json!({ "studentId": student_id }));
    assert_eq!(gone["removedEntries"], json!(0));
    request_ok(&mut stdin, &mut reader, "18", "classes.delete", json!({ "classId": class_id }));
    request_ok(&mut stdin, &mut reader, "19", "levels.delete", json!({ "id": level_id }));
    let missing = request(&mut stdin, &mut reader, "20", "levels.delete", json!({ "id": level_id }));
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn admins_and_years_keep_their_invariants() {
    let workspace = temp_dir("bananas-master-admins");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let root = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "admins.create",
        json!({ "username": "Root", "name": "Kepala Sekolah" }),
    );
    assert_eq!(root["username"], json!("root"));
    let root_id = root["adminId"].as_str().expect("admin id").to_string();
    let taken = request(
        &mut stdin,
        &mut reader,
        "2",
        "admins.create",
        json!({ "username": "ROOT", "name": "Other" }),
    );
    assert_eq!(error_code(&taken), "conflict");

    let last = request(&mut stdin, &mut reader, "3", "admins.delete", json!({ "adminId": root_id }));
    assert_eq!(error_code(&last), "conflict");

    let ops = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "admins.create",
        json!({ "username": "ops", "name": "Operator" }),
    );
    request_ok(&mut stdin, &mut reader, "5", "admins.delete", json!({ "adminId": root_id }));
    let admins = request_ok(&mut stdin, &mut reader, "6", "admins.list", json!({}));
    assert_eq!(admins["admins"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(admins["admins"][0]["id"], ops["adminId"]);

    let y1 = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "years.create",
        json!({ "label": "2025/2026", "active": true }),
    );
    let y2 = request_ok(&mut stdin, &mut reader, "8", "years.create", json!({ "label": "2026/2027" }));
    request_ok(&mut stdin, &mut reader, "9", "years.activate", json!({ "id": y2["id"] }));

    let years = request_ok(&mut stdin, &mut reader, "10", "years.list", json!({}));
    let active: Vec<&serde_json::Value> = years["years"]
        .as_array()
        .expect("years")
        .iter()
        .filter(|y| y["active"] == json!(true))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["id"], y2["id"]);

    let busy = request(&mut stdin, &mut reader, "11", "years.delete", json!({ "id": y2["id"] }));
    assert_eq!(error_code(&busy), "conflict");
    request_ok(&mut stdin, &mut reader, "12", "years.delete", json!({ "id": y1["id"] }));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
