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

fn create_scale(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    bands: serde_json::Value,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "scales.create",
        json!({ "name": name, "bands": bands }),
    );
    created
        .get("scaleId")
        .and_then(|v| v.as_str())
        .expect("scaleId")
        .to_string()
}

fn active_scales(listed: &serde_json::Value) -> Vec<String> {
    listed
        .get("scales")
        .and_then(|v| v.as_array())
        .expect("scales")
        .iter()
        .filter(|s| s.get("isActive").and_then(|v| v.as_bool()) == Some(true))
        .map(|s| {
            s.get("name")
                .and_then(|v| v.as_str())
                .expect("name")
                .to_string()
        })
        .collect()
}

#[test]
fn activation_swaps_atomically_and_never_doubles_up() {
    let workspace = temp_dir("resultd-activation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let default_bands = json!([
        { "minScore": 0.0, "maxScore": 49.0, "letter": "F", "gpa": 0.0 },
        { "minScore": 50.0, "maxScore": 100.0, "letter": "A", "gpa": 5.0 }
    ]);
    let scale_a = create_scale(&mut stdin, &mut reader, "a", "Scale A", default_bands.clone());
    let scale_b = create_scale(&mut stdin, &mut reader, "b", "Scale B", default_bands);

    let listed = request_ok(&mut stdin, &mut reader, "l0", "scales.list", json!({}));
    assert!(active_scales(&listed).is_empty());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "act1",
        "scales.activate",
        json!({ "scaleId": scale_a }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l1", "scales.list", json!({}));
    assert_eq!(active_scales(&listed), vec!["Scale A"]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "act2",
        "scales.activate",
        json!({ "scaleId": scale_b }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l2", "scales.list", json!({}));
    assert_eq!(active_scales(&listed), vec!["Scale B"]);

    // The active scale refuses deletion; an inactive one goes quietly.
    let refused = request(
        &mut stdin,
        &mut reader,
        "del1",
        "scales.delete",
        json!({ "scaleId": scale_b }),
    );
    assert_eq!(refused.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("scale_active")
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del2",
        "scales.delete",
        json!({ "scaleId": scale_a }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l3", "scales.list", json!({}));
    assert_eq!(
        listed
            .get("scales")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn marks_derive_grades_from_the_active_scale_at_read_time() {
    let workspace = temp_dir("resultd-derive");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "sub1",
        "subjects.create",
        json!({ "code": "SCI", "name": "Science" }),
    );
    let subject_id = subject
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
            "classId": "c9",
            "sectionId": "a",
            "year": 2025,
            "lastName": "Derived",
            "firstName": "Grade"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "ex1",
        "exams.create",
        json!({ "name": "Final Exam", "classId": "c9", "sectionId": "a", "year": 2025 }),
    );
    let exam_id = exam
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.upsert",
        json!({
            "examId": exam_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "score": 75.0
        }),
    );

    // Without a scale the embedded table applies: 75 is an "A" at 4.0.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "ml1",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    let mark = listed
        .get("marks")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .expect("mark");
    assert_eq!(mark.get("letter").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(mark.get("gpa").and_then(|v| v.as_f64()), Some(4.0));

    // A custom active scale changes the same stored score's grade: the
    // gpa is derived at read time, never stored.
    let scale_id = {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            "sc1",
            "scales.create",
            json!({
                "name": "Harsh",
                "bands": [
                    { "minScore": 0.0, "maxScore": 79.0, "letter": "L", "gpa": 1.5 },
                    { "minScore": 80.0, "maxScore": 100.0, "letter": "H", "gpa": 4.8 }
                ]
            }),
        );
        created
            .get("scaleId")
            .and_then(|v| v.as_str())
            .expect("scaleId")
            .to_string()
    };
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "act1",
        "scales.activate",
        json!({ "scaleId": scale_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "ml2",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    let mark = listed
        .get("marks")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .expect("mark");
    assert_eq!(mark.get("letter").and_then(|v| v.as_str()), Some("L"));
    assert_eq!(mark.get("gpa").and_then(|v| v.as_f64()), Some(1.5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
