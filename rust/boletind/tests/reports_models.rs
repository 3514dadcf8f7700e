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

fn find_by<'a>(rows: &'a [serde_json::Value], path: &[&str], want: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| {
            let mut v = *r;
            for p in path {
                v = &v[*p];
            }
            v.as_str() == Some(want)
        })
        .unwrap_or_else(|| panic!("no row with {:?} = {}", path, want))
}

#[test]
fn report_models_aggregate_status_and_tiers() {
    let workspace = temp_dir("boletin-reports");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let ana = seed_one(&mut stdin, &mut reader, "Matemáticas");
    let lenguaje = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Lenguaje", "area": "Humanidades" }),
    );
    let lenguaje_id = lenguaje["subjectId"].as_str().expect("subjectId").to_string();

    let luis = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "lastName": "Pérez", "firstName": "Luis" }),
    );
    let luis_enrollment = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.create",
        json!({
            "studentId": luis["studentId"],
            "academicYear": 2026,
            "gradeLevel": "7",
            "groupName": "7B"
        }),
    );
    let luis_enrollment_id = luis_enrollment["enrollmentId"]
        .as_str()
        .expect("enrollmentId")
        .to_string();

    let saves = [
        json!({
            "enrollmentId": ana.enrollment_id,
            "subjectId": ana.subject_id,
            "bimestre1": 4.0,
            "bimestre2": 5.0,
            "fallas": 3,
            "observations": [{ "academic": "Participa", "behavioral": "" }]
        }),
        json!({
            "enrollmentId": luis_enrollment_id,
            "subjectId": ana.subject_id,
            "bimestre1": 2.0,
            "bimestre2": 2.0,
            "fallas": 1
        }),
        json!({
            "enrollmentId": luis_enrollment_id,
            "subjectId": lenguaje_id,
            "bimestre1": 3.0,
            "bimestre2": 3.0,
            "bimestre3": 3.0,
            "bimestre4": 3.0
        }),
    ];
    for (i, params) in saves.into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("save-{}", i),
            "grades.save",
            params,
        );
    }

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.studentReportModel",
        json!({ "enrollmentId": ana.enrollment_id }),
    );
    assert_eq!(card["student"]["displayName"], json!("Rojas, Ana"));
    assert_eq!(card["enrollment"]["groupName"], json!("7A"));
    let subjects = card["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2, "every catalog subject appears");

    let mat = find_by(subjects, &["subject", "name"], "Matemáticas");
    assert_eq!(mat["exists"], json!(true));
    assert_eq!(mat["promedio"].as_f64(), Some(4.5));
    assert_eq!(mat["estado"], json!("Aprobado"));
    assert_eq!(mat["tier"]["label"], json!("Alto"));
    assert_eq!(mat["tier"]["color"], json!("#2563eb"));
    assert_eq!(mat["nc"].as_f64(), Some(3.0));
    assert_eq!(mat["observations"][0]["academic"], json!("Participa"));

    let len = find_by(subjects, &["subject", "name"], "Lenguaje");
    assert_eq!(len["exists"], json!(false));
    assert_eq!(len["estado"], json!("Pendiente"));
    assert!(len["tier"].is_null());

    assert_eq!(card["statusCounts"]["Pendiente"].as_u64(), Some(1));
    assert_eq!(card["statusCounts"]["Aprobado"].as_u64(), Some(1));
    assert_eq!(card["statusCounts"]["Reprobado"].as_u64(), Some(0));
    assert_eq!(card["overall"]["promedio"].as_f64(), Some(4.5));
    assert_eq!(card["overall"]["subjectCount"].as_u64(), Some(1));
    assert_eq!(card["totalFallas"].as_i64(), Some(3));

    let legend = card["tierLegend"].as_array().expect("legend");
    assert_eq!(legend.len(), 4);
    assert_eq!(legend[0]["label"], json!("Bajo"));
    assert_eq!(legend[0]["max"].as_f64(), Some(3.0));
    assert_eq!(legend[3]["label"], json!("Superior"));
    assert_eq!(legend[3]["min"].as_f64(), Some(4.7));
    assert_eq!(legend[3]["max"].as_f64(), Some(5.0));

    let luis_card = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.studentReportModel",
        json!({ "enrollmentId": luis_enrollment_id }),
    );
    let luis_subjects = luis_card["subjects"].as_array().expect("subjects");
    // A full year at the threshold owes nothing.
    let luis_len = find_by(luis_subjects, &["subject", "name"], "Lenguaje");
    assert!(luis_len["nc"].is_null());
    let luis_mat = find_by(luis_subjects, &["subject", "name"], "Matemáticas");
    assert_eq!(luis_mat["nc"].as_f64(), Some(8.0));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.subjectSummaryModel",
        json!({ "subjectId": ana.subject_id, "academicYear": 2026 }),
    );
    let rows = summary["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["displayName"], json!("Pérez, Luis"));
    assert_eq!(rows[0]["estado"], json!("Reprobado"));
    assert_eq!(rows[1]["displayName"], json!("Rojas, Ana"));
    assert_eq!(summary["statusCounts"]["Aprobado"].as_u64(), Some(1));
    assert_eq!(summary["statusCounts"]["Reprobado"].as_u64(), Some(1));
    let tiers = summary["tierCounts"].as_array().expect("tierCounts");
    assert_eq!(tiers.len(), 4);
    assert_eq!(find_by(tiers, &["label"], "Bajo")["count"].as_u64(), Some(1));
    assert_eq!(find_by(tiers, &["label"], "Alto")["count"].as_u64(), Some(1));
    assert_eq!(find_by(tiers, &["label"], "Superior")["count"].as_u64(), Some(0));
    assert_eq!(summary["groupAverage"]["promedio"].as_f64(), Some(3.25));
    assert_eq!(summary["groupAverage"]["estado"], json!("Aprobado"));

    let group_only = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.subjectSummaryModel",
        json!({ "subjectId": ana.subject_id, "academicYear": 2026, "groupName": "7A" }),
    );
    assert_eq!(group_only["rows"].as_array().map(|r| r.len()), Some(1));

    let missing = request(
        &mut stdin,
        &mut reader,
        "9",
        "reports.studentReportModel",
        json!({ "enrollmentId": "nope" }),
    );
    assert_eq!(error_code(&missing), "not_found");
    let no_year = request(
        &mut stdin,
        &mut reader,
        "10",
        "reports.subjectSummaryModel",
        json!({ "subjectId": ana.subject_id }),
    );
    assert_eq!(error_code(&no_year), "bad_params");

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
