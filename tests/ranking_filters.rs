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

fn id_of(v: &serde_json::Value, key: &str) -> String {
    v[key].as_str().expect("id field").to_string()
}

struct School {
    level_x: String,
    level_xi: String,
    major_ipa: String,
    major_ips: String,
    class_x_ipa: String,
    class_xi_ipa: String,
    math: String,
    students: Vec<(String, String)>,
}

fn setup_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> School {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let level_x = id_of(&request_ok(stdin, reader, "l1", "levels.create", json!({ "name": "X" })), "id");
    let level_xi = id_of(&request_ok(stdin, reader, "l2", "levels.create", json!({ "name": "XI" })), "id");
    let major_ipa = id_of(&request_ok(stdin, reader, "m1", "majors.create", json!({ "name": "IPA" })), "id");
    let major_ips = id_of(&request_ok(stdin, reader, "m2", "majors.create", json!({ "name": "IPS" })), "id");

    let mut class = |id: &str, name: &str, level: &str, major: &str| {
        id_of(
            &request_ok(
                stdin,
                reader,
                id,
                "classes.create",
                json!({ "name": name, "levelId": level, "majorId": major }),
            ),
            "classId",
        )
    };
    let class_x_ipa = class("c1", "X-IPA-1", &level_x, &major_ipa);
    let class_x_ips = class("c2", "X-IPS-1", &level_x, &major_ips);
    let class_xi_ipa = class("c3", "XI-IPA-1", &level_xi, &major_ipa);

    let math = id_of(&request_ok(stdin, reader, "s1", "subjects.create", json!({ "name": "Mathematics" })), "id");

    let mut students = Vec::new();
    for (i, (nis, name, class_id)) in [
        ("4001", "Ayu", &class_x_ipa),
        ("4002", "Budi", &class_x_ips),
        ("4003", "Citra", &class_xi_ipa),
        ("4004", "Dewi", &class_x_ipa),
    ]
    .into_iter()
    .enumerate()
    {
        let created = request_ok(
            stdin,
            reader,
            &format!("st{}", i),
            "students.create",
            json!({ "nis": nis, "name": name, "classId": class_id }),
        );
        students.push((name.to_string(), id_of(&created, "studentId")));
    }

    School {
        level_x,
        level_xi,
        major_ipa,
        major_ips,
        class_x_ipa,
        class_xi_ipa,
        math,
        students,
    }
}

fn names(rows: &serde_json::Value) -> Vec<String> {
    rows.as_array()
        .expect("rows")
        .iter()
        .map(|r| r["studentName"].as_str().expect("studentName").to_string())
        .collect()
}

#[test]
fn ranking_orders_by_validated_mean_and_intersects_filters() {
    let workspace = temp_dir("bananas-ranking-filters");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = setup_school(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "cfg",
        "settings.update",
        json!({ "section": "grading", "patch": { "requireValidation": false } }),
    );
    for (i, ((_, student_id), value)) in school
        .students
        .iter()
        .zip([70.0, 90.0, 80.0, 80.0])
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.submit",
            json!({ "studentId": student_id, "subjectId": school.math, "semester": 1, "value": value }),
        );
    }

    let all = request_ok(&mut stdin, &mut reader, "1", "ranking.compute", json!({ "filters": {} }));
    assert_eq!(all["total"], json!(4));
    assert_eq!(names(&all["rows"]), vec!["Budi", "Citra", "Dewi", "Ayu"]);
    let ranks: Vec<i64> = all["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["rank"].as_i64().expect("rank"))
        .collect();
    assert_eq!(ranks, vec![1, 2, 3, 4]);
    assert_eq!(all["rows"][0]["band"]["letter"], json!("A"));
    assert_eq!(all["rows"][0]["className"], json!("X-IPS-1"));

    let both = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "ranking.compute",
        json!({ "filters": { "levelId": school.level_x, "majorId": school.major_ipa } }),
    );
    assert_eq!(names(&both["rows"]), vec!["Dewi", "Ayu"]);

    let by_major = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "ranking.compute",
        json!({ "filters": { "levelId": "ALL", "majorId": school.major_ipa, "classId": "" } }),
    );
    assert_eq!(names(&by_major["rows"]), vec!["Citra", "Dewi", "Ayu"]);

    let by_class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "ranking.compute",
        json!({ "filters": { "classId": school.class_xi_ipa } }),
    );
    assert_eq!(names(&by_class["rows"]), vec!["Citra"]);

    let limited = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "ranking.compute",
        json!({ "filters": {}, "limit": 2 }),
    );
    assert_eq!(limited["total"], json!(4));
    assert_eq!(limited["rows"].as_array().map(|a| a.len()), Some(2));

    let other_semester = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "ranking.compute",
        json!({ "filters": { "semester": 2 } }),
    );
    assert_eq!(other_semester["total"], json!(0));

    let bad = request(
        &mut stdin,
        &mut reader,
        "7",
        "ranking.compute",
        json!({ "filters": { "semester": 9 } }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pending_and_rejected_entries_do_not_count() {
    let workspace = temp_dir("bananas-ranking-pending");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = setup_school(&mut stdin, &mut reader, &workspace);
    let ayu = school.students[0].1.clone();
    let budi = school.students[1].1.clone();

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.submit",
        json!({ "studentId": ayu, "subjectId": school.math, "semester": 1, "value": 88.0 }),
    );
    let ayu_entry = id_of(&submitted, "entryId");
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submit",
        json!({ "studentId": budi, "subjectId": school.math, "semester": 1, "value": 95.0 }),
    );
    let budi_entry = id_of(&submitted, "entryId");

    let none = request_ok(&mut stdin, &mut reader, "3", "ranking.compute", json!({}));
    assert_eq!(none["total"], json!(0));

    request_ok(&mut stdin, &mut reader, "4", "grades.validate", json!({ "entryId": ayu_entry }));
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.reject",
        json!({ "entryId": budi_entry, "note": "copied" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "settings.update",
        json!({ "section": "ranking", "patch": { "showRejected": true } }),
    );

    let ranked = request_ok(&mut stdin, &mut reader, "7", "ranking.compute", json!({}));
    assert_eq!(names(&ranked["rows"]), vec!["Ayu"]);
    assert_eq!(ranked["rows"][0]["average"], json!(88.0));
    assert_eq!(ranked["rows"][0]["rejectedCount"], json!(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn filter_options_cascade_from_level_to_class() {
    let workspace = temp_dir("bananas-ranking-options");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = setup_school(&mut stdin, &mut reader, &workspace);

    let open = request_ok(&mut stdin, &mut reader, "1", "ranking.filterOptions", json!({}));
    assert_eq!(open["levels"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(open["majors"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(open["classes"].as_array().map(|a| a.len()), Some(3));

    let xi = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "ranking.filterOptions",
        json!({ "levelId": school.level_xi }),
    );
    assert_eq!(xi["majors"][0]["id"], json!(school.major_ipa));
    assert_eq!(xi["majors"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(xi["classes"][0]["id"], json!(school.class_xi_ipa));

    // A major or class outside the chosen level is dropped.
    let mismatched = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "ranking.filterOptions",
        json!({ "levelId": school.level_xi, "majorId": school.major_ips, "classId": school.class_x_ipa }),
    );
    assert!(mismatched["selection"]["majorId"].is_null());
    assert!(mismatched["selection"]["classId"].is_null());
    assert_eq!(mismatched["selection"]["levelId"], json!(school.level_xi));

    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "ranking.filterOptions",
        json!({ "levelId": school.level_x, "majorId": school.major_ipa, "classId": school.class_x_ipa }),
    );
    assert_eq!(kept["selection"]["classId"], json!(school.class_x_ipa));
    assert_eq!(kept["filters"]["majorId"], json!(school.major_ipa));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "ranking.filterOptions",
        json!({ "levelId": "ALL", "majorId": school.major_ipa, "classId": school.class_x_ipa }),
    );
    assert!(cleared["selection"]["levelId"].is_null());
    assert_eq!(cleared["selection"]["majorId"], json!(school.major_ipa));
    assert_eq!(cleared["classes"].as_array().map(|a| a.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
