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
    let exe = env!("CARGO_BIN_EXE_boletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn boletind");
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

struct Seeded {
    enrollment_id: String,
    subject_id: String,
}

fn seed_one(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    subject_name: &str,
) -> Seeded {
    let student = request_ok(
        stdin,
        reader,
        "seed-1",
        "students.create",
        json!({ "lastName": "Rojas", "firstName": "Ana", "documentId": "1020" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "seed-2",
        "subjects.create",
        json!({ "name": subject_name, "area": "Ciencias" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let enrollment = request_ok(
        stdin,
        reader,
        "seed-3",
        "enrollments.create",
        json!({
            "studentId": student_id,
            "academicYear": 2026,
            "gradeLevel": "7",
            "groupName": "7A",
            "site": "Sede Principal"
        }),
    );
    let enrollment_id = enrollment["enrollmentId"]
        .as_str()
        .expect("enrollmentId")
        .to_string();
    Seeded {
        enrollment_id,
        subject_id,
    }
}

#[test]
fn every_method_family_is_routed() {
    let workspace = temp_dir("boletin-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert!(health["version"].as_str().is_some());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("boletin.sqlite3").is_file());

    let methods = [
        "students.create",
        "students.list",
        "subjects.create",
        "subjects.list",
        "enrollments.create",
        "enrollments.list",
        "grades.get",
        "grades.preview",
        "grades.save",
        "grades.list",
        "grades.indicators.add",
        "grades.indicators.remove",
        "calc.classify",
        "calc.config.get",
        "calc.config.update",
        "calc.config.clearOverride",
        "reports.studentReportModel",
        "reports.subjectSummaryModel",
    ];
    for (i, method) in methods.iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("m-{}", i),
            method,
            json!({}),
        );
        assert_ne!(error_code(&resp), "not_implemented", "{} not routed", method);
    }

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn roster_methods_validate_and_list() {
    let workspace = temp_dir("boletin-roster");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let blank = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "  ", "firstName": "Ana" }),
    );
    assert_eq!(error_code(&blank), "bad_params");

    let seeded = seed_one(&mut stdin, &mut reader, "Química");
    let dup_subject = request(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Química" }),
    );
    assert_eq!(error_code(&dup_subject), "conflict");

    let students = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let student_id = students["students"][0]["id"].clone();
    assert_eq!(students["students"][0]["displayName"], json!("Rojas, Ana"));

    let dup_year = request(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.create",
        json!({ "studentId": student_id, "academicYear": 2026 }),
    );
    assert_eq!(error_code(&dup_year), "conflict");

    let ghost = request(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "studentId": "ghost", "academicYear": 2026 }),
    );
    assert_eq!(error_code(&ghost), "not_found");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "enrollments.list",
        json!({ "academicYear": 2026 }),
    );
    let enrollments = listed["enrollments"].as_array().expect("enrollments");
    assert_eq!(enrollments.len(), 1);
    assert_eq!(enrollments[0]["id"], json!(seeded.enrollment_id));

    let other_year = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "enrollments.list",
        json!({ "academicYear": 2025 }),
    );
    assert_eq!(other_year["enrollments"], json!([]));

    let subjects = request_ok(&mut stdin, &mut reader, "9", "subjects.list", json!({}));
    assert_eq!(subjects["subjects"][0]["id"], json!(seeded.subject_id));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
