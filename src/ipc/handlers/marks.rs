use crate::db;
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_UPSERT_MAX_ENTRIES: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn require_row(conn: &Connection, table: &str, id: &str) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("{} row not found", table),
            details: Some(json!({ "id": id })),
        });
    }
    Ok(())
}

fn resolve_score(value: Option<f64>) -> Result<f64, HandlerErr> {
    match value {
        Some(v) if v.is_finite() && (0.0..=100.0).contains(&v) => Ok(v),
        Some(v) => Err(HandlerErr {
            code: "bad_params",
            message: "score must be in [0, 100]".to_string(),
            details: Some(json!({ "score": v })),
        }),
        None => Err(HandlerErr {
            code: "bad_params",
            message: "missing numeric score".to_string(),
            details: None,
        }),
    }
}

/// One logical mark per (exam, student, subject): writes go through an
/// upsert keyed on that tuple.
fn upsert_mark(
    conn: &Connection,
    exam_id: &str,
    student_id: &str,
    subject_id: &str,
    score: f64,
) -> Result<(), HandlerErr> {
    let mark_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marks(id, exam_id, student_id, subject_id, score, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, student_id, subject_id) DO UPDATE SET
           score = excluded.score,
           updated_at = excluded.updated_at",
        (
            &mark_id,
            exam_id,
            student_id,
            subject_id,
            score,
            db::now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "marks" })),
    })?;
    Ok(())
}

fn handle_marks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let score = match resolve_score(req.params.get("score").and_then(|v| v.as_f64())) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    for (table, id) in [
        ("exams", exam_id.as_str()),
        ("students", student_id.as_str()),
        ("subjects", subject_id.as_str()),
    ] {
        if let Err(e) = require_row(conn, table, id) {
            return e.response(&req.id);
        }
    }

    if let Err(e) = upsert_mark(conn, &exam_id, &student_id, &subject_id, score) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_marks_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };

    if entries.len() > BULK_UPSERT_MAX_ENTRIES {
        return err(
            &req.id,
            "too_many_entries",
            format!(
                "bulk payload exceeds max entries: {} > {}",
                entries.len(),
                BULK_UPSERT_MAX_ENTRIES
            ),
            Some(json!({ "max": BULK_UPSERT_MAX_ENTRIES })),
        );
    }

    if let Err(e) = require_row(conn, "exams", &exam_id) {
        return e.response(&req.id);
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "entry must be an object",
            }));
            continue;
        };

        let student_id = obj.get("studentId").and_then(|v| v.as_str());
        let subject_id = obj.get("subjectId").and_then(|v| v.as_str());
        let (Some(student_id), Some(subject_id)) = (student_id, subject_id) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "entry missing studentId/subjectId",
            }));
            continue;
        };

        let score = match resolve_score(obj.get("score").and_then(|v| v.as_f64())) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        let lookups = [("students", student_id), ("subjects", subject_id)]
            .into_iter()
            .try_for_each(|(table, id)| require_row(conn, table, id));
        if let Err(e) = lookups {
            errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            }));
            continue;
        }

        match upsert_mark(conn, &exam_id, student_id, subject_id, score) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let mut result = json!({ "ok": true, "updated": updated });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let subject_id = req
        .params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let student_view = req
        .params
        .get("audience")
        .and_then(|v| v.as_str())
        .map(|a| a.eq_ignore_ascii_case("student"))
        .unwrap_or(false);

    let published: Option<i64> = match conn
        .query_row(
            "SELECT is_published FROM exams WHERE id = ?",
            [&exam_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(published) = published else {
        return err(&req.id, "not_found", "exam not found", None);
    };
    if student_view && published == 0 {
        return err(
            &req.id,
            "not_published",
            "exam results are not published",
            Some(json!({ "examId": exam_id })),
        );
    }

    let bands = match db::active_scale_bands(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT student_id, subject_id, score, updated_at
         FROM marks
         WHERE exam_id = ?1
           AND (?2 IS NULL OR student_id = ?2)
           AND (?3 IS NULL OR subject_id = ?3)
         ORDER BY student_id, subject_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&exam_id, &student_id, &subject_id), |r| {
            let score: f64 = r.get(2)?;
            let grade = grading::grade_for_score(score, &bands);
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "score": score,
                "gpa": grade.gpa,
                "letter": grade.letter,
                "updatedAt": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(marks) => ok(&req.id, json!({ "examId": exam_id, "marks": marks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.upsert" => Some(handle_marks_upsert(state, req)),
        "marks.bulkUpsert" => Some(handle_marks_bulk_upsert(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        _ => None,
    }
}
