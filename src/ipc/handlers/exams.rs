use crate::db;
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn valid_term_weight(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

fn exam_has_marks(conn: &Connection, exam_id: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM marks WHERE exam_id = ?",
        [exam_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing classId", None),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid year", None),
    };

    let term_weight = match req.params.get("termWeight") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(w) if valid_term_weight(w) => Some(w),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "termWeight must be a number in [0, 1]",
                    Some(json!({ "termWeight": v })),
                )
            }
        },
    };
    let published = req
        .params
        .get("published")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let exam_id = Uuid::new_v4().to_string();
    let now = db::now_stamp();
    let insert = conn.execute(
        "INSERT INTO exams(id, name, class_id, section_id, year, term_weight,
                           is_published, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &name,
            &class_id,
            &section_id,
            year,
            term_weight,
            published as i64,
            &now,
            &now,
        ),
    );
    if let Err(e) = insert {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    let weights = db::term_weights(conn);
    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "effectiveWeight": grading::weight_for_exam(term_weight, &name, &weights),
        }),
    )
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid year", None),
    };
    let student_view = req
        .params
        .get("audience")
        .and_then(|v| v.as_str())
        .map(|a| a.eq_ignore_ascii_case("student"))
        .unwrap_or(false);

    let weights = db::term_weights(conn);

    let mut stmt = match conn.prepare(
        "SELECT id, name, term_weight, is_published, created_at
         FROM exams
         WHERE class_id = ?1 AND section_id = ?2 AND year = ?3
           AND (?4 = 0 OR is_published = 1)
         ORDER BY created_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(
            (&class_id, &section_id, year, student_view as i64),
            |r| {
                let name: String = r.get(1)?;
                let term_weight: Option<f64> = r.get(2)?;
                Ok(json!({
                    "examId": r.get::<_, String>(0)?,
                    "name": name.clone(),
                    "termWeight": term_weight,
                    "isPublished": r.get::<_, i64>(3)? != 0,
                    "effectiveWeight": grading::weight_for_exam(term_weight, &name, &weights),
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "exam not found", None);
    }

    // Once marks reference an exam, only its name, weight, and publish
    // flag may change.
    let touches_identity = ["classId", "sectionId", "year"]
        .iter()
        .any(|k| patch.contains_key(*k));
    if touches_identity {
        match exam_has_marks(conn, &exam_id) {
            Ok(true) => {
                return err(
                    &req.id,
                    "exam_locked",
                    "class/section/year cannot change once marks exist",
                    Some(json!({ "examId": exam_id })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(name) = v.as_str().filter(|s| !s.trim().is_empty()) else {
            return err(&req.id, "bad_params", "patch.name must be non-empty", None);
        };
        sets.push("name = ?".to_string());
        binds.push(rusqlite::types::Value::Text(name.to_string()));
    }
    if let Some(v) = patch.get("termWeight") {
        if v.is_null() {
            sets.push("term_weight = NULL".to_string());
        } else {
            let Some(w) = v.as_f64().filter(|w| valid_term_weight(*w)) else {
                return err(
                    &req.id,
                    "bad_params",
                    "patch.termWeight must be null or a number in [0, 1]",
                    None,
                );
            };
            sets.push("term_weight = ?".to_string());
            binds.push(rusqlite::types::Value::Real(w));
        }
    }
    if let Some(v) = patch.get("classId") {
        let Some(s) = v.as_str().filter(|s| !s.trim().is_empty()) else {
            return err(&req.id, "bad_params", "patch.classId must be non-empty", None);
        };
        sets.push("class_id = ?".to_string());
        binds.push(rusqlite::types::Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("sectionId") {
        let Some(s) = v.as_str().filter(|s| !s.trim().is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "patch.sectionId must be non-empty",
                None,
            );
        };
        sets.push("section_id = ?".to_string());
        binds.push(rusqlite::types::Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("year") {
        let Some(y) = v.as_i64() else {
            return err(&req.id, "bad_params", "patch.year must be an integer", None);
        };
        sets.push("year = ?".to_string());
        binds.push(rusqlite::types::Value::Integer(y));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }

    sets.push("updated_at = ?".to_string());
    binds.push(rusqlite::types::Value::Text(db::now_stamp()));
    binds.push(rusqlite::types::Value::Text(exam_id.clone()));

    let sql = format!("UPDATE exams SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        Ok(_) => ok(&req.id, json!({ "examId": exam_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_exams_set_published(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let published = match req.params.get("published").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid published", None),
    };

    let changed = conn.execute(
        "UPDATE exams SET is_published = ?, updated_at = ? WHERE id = ?",
        (published as i64, db::now_stamp(), &exam_id),
    );
    match changed {
        Ok(0) => err(&req.id, "not_found", "exam not found", None),
        Ok(_) => ok(&req.id, json!({ "examId": exam_id, "isPublished": published })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let marks_removed = match tx.execute("DELETE FROM marks WHERE exam_id = ?", [&exam_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    let exams_removed = match tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if exams_removed == 0 {
        return err(&req.id, "not_found", "exam not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "examId": exam_id, "marksRemoved": marks_removed }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.update" => Some(handle_exams_update(state, req)),
        "exams.setPublished" => Some(handle_exams_set_published(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        _ => None,
    }
}
