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
    let exe = env!("CARGO_BIN_EXE_notad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn notad");
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
}

fn wait_for_batch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    job_id: &str,
) -> serde_json::Value {
    for attempt in 0..200 {
        let status = request_ok(
            stdin,
            reader,
            &format!("poll-{attempt}"),
            "batch.status",
            json!({ "jobId": job_id }),
        );
        if status.get("state").and_then(|v| v.as_str()) != Some("running") {
            return status;
        }
        std::thread::sleep(std::time::Duration::from_millis(25));
    }
    panic!("batch {} did not finish", job_id);
}

#[test]
fn sheet_saves_are_all_or_nothing_and_reports_are_generated() {
    let workspace = temp_dir("notad-sheet-reports");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // The startup sweep conflicts with every batch started below.
    let sweep = wait_for_batch(&mut stdin, &mut reader, str_field(&selected, "recalculationJobId"));
    assert_eq!(sweep.get("kind").and_then(|v| v.as_str()), Some("recalculateAll"));
    let class_id = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "6e D" })),
        "classId",
    )
    .to_string();
    let mut student_ids = Vec::new();
    for (i, last) in ["Bernard", "Moreau"].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{i}"),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": "Sam" }),
        );
        student_ids.push(str_field(&created, "studentId").to_string());
    }
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({
            "classId": class_id,
            "name": "Reading",
            "date": "2024-05-20",
            "questions": [
                { "number": "1", "title": "Summary", "pointsMax": 8 },
                { "number": "2", "title": "Vocabulary", "pointsMax": 12 }
            ]
        }),
    );
    let assignment_id = str_field(&created, "assignmentId").to_string();
    let q: Vec<String> = created
        .get("questionIds")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batch.start",
        json!({ "kind": "generateReports", "assignmentId": assignment_id }),
    );
    let failed = wait_for_batch(&mut stdin, &mut reader, str_field(&empty, "jobId"));
    assert_eq!(failed.get("state").and_then(|v| v.as_str()), Some("failed"));

    let rejected = request(
        &mut stdin,
        &mut reader,
        "6",
        "scores.saveSheet",
        json!({
            "studentId": student_ids[0],
            "assignmentId": assignment_id,
            "scores": [
                { "questionId": q[0], "points": 7 },
                { "questionId": q[1], "points": 13 }
            ]
        }),
    );
    assert_eq!(error_code(&rejected), Some("invalid_score"));
    assert_eq!(
        rejected.pointer("/error/details/index").and_then(|v| v.as_u64()),
        Some(1)
    );
    let untouched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scores.get",
        json!({ "studentId": student_ids[0], "assignmentId": assignment_id }),
    );
    assert_eq!(untouched.get("entered").and_then(|v| v.as_u64()), Some(0));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scores.saveSheet",
        json!({
            "studentId": student_ids[0],
            "assignmentId": assignment_id,
            "scores": [
                { "questionId": q[0], "points": 7, "comment": "clear" },
                { "questionId": q[1], "points": 10 }
            ],
            "appreciation": "Very good"
        }),
    );
    assert_eq!(saved.get("saved").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(saved.get("average").and_then(|v| v.as_f64()), Some(17.0));

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "batch.start",
        json!({ "kind": "generateReports", "assignmentId": assignment_id }),
    );
    let done = wait_for_batch(&mut stdin, &mut reader, str_field(&started, "jobId"));
    assert_eq!(done.get("state").and_then(|v| v.as_str()), Some("finished"));
    assert_eq!(done.get("processed").and_then(|v| v.as_u64()), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.list",
        json!({ "assignmentId": assignment_id }),
    );
    let reports = listed
        .get("reports")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(reports.len(), 1, "only the graded student gets a report");
    assert_eq!(
        reports[0].get("studentName").and_then(|v| v.as_str()),
        Some("Bernard Sam")
    );
    assert_eq!(reports[0].get("hasDocument").and_then(|v| v.as_bool()), Some(true));

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.get",
        json!({ "assignmentId": assignment_id, "studentId": student_ids[0] }),
    );
    assert_eq!(
        report.pointer("/report/appreciation").and_then(|v| v.as_str()),
        Some("Very good")
    );
    let document: serde_json::Value =
        serde_json::from_str(str_field(&report, "document")).expect("document is json");
    assert_eq!(document.get("finalGrade").and_then(|v| v.as_f64()), Some(17.0));
    assert_eq!(document.get("scaleTotal").and_then(|v| v.as_f64()), Some(20.0));
    assert_eq!(
        document.get("lines").and_then(|v| v.as_array()).map(|l| l.len()),
        Some(2)
    );

    let report_id = report
        .pointer("/report/id")
        .and_then(|v| v.as_str())
        .expect("report id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reports.delete",
        json!({ "reportId": report_id }),
    );
    let gone = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reports.get",
        json!({ "assignmentId": assignment_id, "studentId": student_ids[0] }),
    );
    assert!(gone.get("report").map(|v| v.is_null()).unwrap_or(false));

    let jobs = request_ok(&mut stdin, &mut reader, "14", "batch.list", json!({}));
    assert_eq!(jobs.get("jobs").and_then(|v| v.as_array()).map(|j| j.len()), Some(3));

    let _ = child.kill();
}
