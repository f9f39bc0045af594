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
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
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

#[test]
fn students_see_only_published_exams_and_renormalized_totals() {
    let workspace = temp_dir("resultd-published");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let math = request_ok(
        &mut stdin,
        &mut reader,
        "sub1",
        "subjects.create",
        json!({ "code": "MATH", "name": "Mathematics" }),
    );
    let math_id = math
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "st1",
        "students.create",
        json!({
            "classId": "c8",
            "sectionId": "b",
            "year": 2025,
            "lastName": "Reader",
            "firstName": "Quiet"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let mut exam_ids = Vec::new();
    for (i, name) in ["1st Term", "2nd Term", "Final Exam"].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("ex{}", i),
            "exams.create",
            json!({ "name": name, "classId": "c8", "sectionId": "b", "year": 2025 }),
        );
        exam_ids.push(
            created
                .get("examId")
                .and_then(|v| v.as_str())
                .expect("examId")
                .to_string(),
        );
    }

    for (i, (exam_id, score)) in exam_ids
        .iter()
        .zip([80.0, 90.0, 70.0])
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "marks.upsert",
            json!({
                "examId": exam_id,
                "studentId": student_id,
                "subjectId": math_id,
                "score": score
            }),
        );
    }

    // Publish the 1st term and the final; the 2nd term stays hidden.
    for (i, exam_id) in [&exam_ids[0], &exam_ids[2]].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("p{}", i),
            "exams.setPublished",
            json!({ "examId": exam_id, "published": true }),
        );
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "exams.list",
        json!({
            "classId": "c8",
            "sectionId": "b",
            "year": 2025,
            "audience": "student"
        }),
    );
    let names: Vec<&str> = listed
        .get("exams")
        .and_then(|v| v.as_array())
        .expect("exams")
        .iter()
        .map(|e| e.get("name").and_then(|v| v.as_str()).expect("name"))
        .collect();
    assert_eq!(names, vec!["1st Term", "Final Exam"]);

    // Direct mark reads on an unpublished exam are refused for students
    // but allowed for the admin view.
    let refused = request(
        &mut stdin,
        &mut reader,
        "ml1",
        "marks.list",
        json!({ "examId": exam_ids[1], "audience": "student" }),
    );
    assert_eq!(refused.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_published")
    );
    let admin_view = request_ok(
        &mut stdin,
        &mut reader,
        "ml2",
        "marks.list",
        json!({ "examId": exam_ids[1] }),
    );
    assert_eq!(
        admin_view
            .get("marks")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    // The student grand total only sees the published 0.25 + 0.50 and
    // renormalizes over them.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "gt1",
        "reports.grandTotal",
        json!({
            "classId": "c8",
            "sectionId": "b",
            "year": 2025,
            "studentId": student_id,
            "audience": "student"
        }),
    );
    assert_eq!(
        report
            .get("exams")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );
    let math_row = report
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .expect("math row");
    // (80*0.25 + 70*0.50) / 0.75
    assert_eq!(math_row.get("score").and_then(|v| v.as_f64()), Some(73.33));

    // The admin view still combines all three.
    let admin_report = request_ok(
        &mut stdin,
        &mut reader,
        "gt2",
        "reports.grandTotal",
        json!({
            "classId": "c8",
            "sectionId": "b",
            "year": 2025,
            "studentId": student_id
        }),
    );
    let math_row = admin_report
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .expect("math row");
    assert_eq!(math_row.get("score").and_then(|v| v.as_f64()), Some(77.5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_exam_result_requires_publication() {
    let workspace = temp_dir("resultd-published-single");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "st1",
        "students.create",
        json!({
            "classId": "c8",
            "sectionId": "b",
            "year": 2025,
            "lastName": "Reader",
            "firstName": "Quiet"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "ex1",
        "exams.create",
        json!({ "name": "Final Exam", "classId": "c8", "sectionId": "b", "year": 2025 }),
    );
    let exam_id = created
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();

    let refused = request(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.examResult",
        json!({ "examId": exam_id, "studentId": student_id, "audience": "student" }),
    );
    assert_eq!(refused.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_published")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "exams.setPublished",
        json!({ "examId": exam_id, "published": true }),
    );
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.examResult",
        json!({ "examId": exam_id, "studentId": student_id, "audience": "student" }),
    );
    // No marks yet: empty rows and a null summary, not an error.
    assert_eq!(
        report
            .get("subjects")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    assert!(report.get("summary").map(|s| s.is_null()).unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
