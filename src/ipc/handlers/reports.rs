use crate::db;
use crate::engine::{self, SqliteMarkSource, WeightedExam};
use crate::grading::{self, round_off_2_decimals};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

struct SubjectMeta {
    code: String,
    name: String,
    sort_order: i64,
}

fn subject_meta(conn: &Connection) -> rusqlite::Result<HashMap<String, SubjectMeta>> {
    let mut stmt = conn.prepare("SELECT id, code, name, sort_order FROM subjects")?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            SubjectMeta {
                code: r.get(1)?,
                name: r.get(2)?,
                sort_order: r.get(3)?,
            },
        ))
    })?;
    rows.collect()
}

fn student_display_name(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT last_name, first_name FROM students WHERE id = ?",
        [student_id],
        |r| {
            let last: String = r.get(0)?;
            let first: String = r.get(1)?;
            Ok(format!("{}, {}", last, first))
        },
    )
    .optional()
}

fn is_student_view(req: &Request) -> bool {
    req.params
        .get("audience")
        .and_then(|v| v.as_str())
        .map(|a| a.eq_ignore_ascii_case("student"))
        .unwrap_or(false)
}

fn summary_json(pairs: &[(f64, f64)], bands: &[grading::ScaleBand]) -> serde_json::Value {
    match grading::summarize(pairs, bands) {
        Some(s) => json!({
            "subjectCount": s.subject_count,
            "totalScore": round_off_2_decimals(s.total_score),
            "averageScore": round_off_2_decimals(s.average_score),
            "gpa": round_off_2_decimals(s.gpa),
            "letter": s.letter,
        }),
        None => serde_json::Value::Null,
    }
}

fn handle_exam_result(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_view = is_student_view(req);

    let exam_row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT name, is_published FROM exams WHERE id = ?",
            [&exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((exam_name, published)) = exam_row else {
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

    let display_name = match student_display_name(conn, &student_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let bands = match db::active_scale_bands(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let meta = match subject_meta(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt =
        match conn.prepare("SELECT subject_id, score FROM marks WHERE exam_id = ? AND student_id = ?")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let marks = stmt
        .query_map((&exam_id, &student_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut marks = match marks {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    marks.sort_by_key(|(subject_id, _)| {
        meta.get(subject_id)
            .map(|m| (m.sort_order, m.code.clone()))
            .unwrap_or((i64::MAX, subject_id.clone()))
    });

    let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(marks.len());
    let subjects: Vec<serde_json::Value> = marks
        .iter()
        .map(|(subject_id, score)| {
            let grade = grading::grade_for_score(*score, &bands);
            pairs.push((*score, grade.gpa));
            let m = meta.get(subject_id);
            json!({
                "subjectId": subject_id,
                "subjectCode": m.map(|m| m.code.clone()),
                "subjectName": m.map(|m| m.name.clone()),
                "score": round_off_2_decimals(*score),
                "gpa": grade.gpa,
                "letter": grade.letter,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "examName": exam_name,
            "studentId": student_id,
            "displayName": display_name,
            "subjects": subjects,
            "summary": summary_json(&pairs, &bands),
        }),
    )
}

fn handle_grand_total(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.as_ref() else {
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
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let student_view = is_student_view(req);

    let display_name = match student_display_name(conn, &student_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let weights = db::term_weights(conn);
    let mut stmt = match conn.prepare(
        "SELECT id, name, term_weight, is_published
         FROM exams
         WHERE class_id = ?1 AND section_id = ?2 AND year = ?3
           AND (?4 = 0 OR is_published = 1)
         ORDER BY created_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let exams = stmt
        .query_map((&class_id, &section_id, year, student_view as i64), |r| {
            let name: String = r.get(1)?;
            let term_weight: Option<f64> = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                name,
                term_weight,
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let exams = match exams {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let bands = match db::active_scale_bands(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let meta = match subject_meta(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let exam_models: Vec<serde_json::Value> = exams
        .iter()
        .map(|(id, name, term_weight, is_published)| {
            json!({
                "examId": id,
                "name": name,
                "weight": grading::weight_for_exam(*term_weight, name, &weights),
                "isPublished": is_published,
            })
        })
        .collect();

    // Only weighted exams join the fetch batch; everything else is
    // excluded from the aggregate by definition.
    let weighted: Vec<WeightedExam> = exams
        .iter()
        .filter_map(|(id, name, term_weight, _)| {
            let weight = grading::weight_for_exam(*term_weight, name, &weights);
            (weight > 0.0).then(|| WeightedExam {
                exam_id: id.clone(),
                weight,
            })
        })
        .collect();

    let generation = state.selection.begin();
    let source = SqliteMarkSource::new(workspace, bands.clone());
    let combined = engine::grand_total(
        &source,
        &state.selection,
        generation,
        &weighted,
        &student_id,
        &bands,
    );
    let Some(combined) = combined else {
        return err(
            &req.id,
            "stale_selection",
            "selection changed while marks were loading",
            None,
        );
    };

    let mut rows: Vec<(&String, &grading::CombinedMark)> = combined.iter().collect();
    rows.sort_by_key(|(subject_id, _)| {
        meta.get(subject_id.as_str())
            .map(|m| (m.sort_order, m.code.clone()))
            .unwrap_or((i64::MAX, (*subject_id).clone()))
    });

    let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(rows.len());
    let subjects: Vec<serde_json::Value> = rows
        .iter()
        .map(|(subject_id, mark)| {
            pairs.push((mark.score, mark.gpa));
            let m = meta.get(subject_id.as_str());
            json!({
                "subjectId": subject_id,
                "subjectCode": m.map(|m| m.code.clone()),
                "subjectName": m.map(|m| m.name.clone()),
                "score": round_off_2_decimals(mark.score),
                "gpa": round_off_2_decimals(mark.gpa),
                "letter": mark.letter,
                "examsCounted": mark.exams_counted,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "displayName": display_name,
            "classId": class_id,
            "sectionId": section_id,
            "year": year,
            "exams": exam_models,
            "subjects": subjects,
            "summary": summary_json(&pairs, &bands),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.examResult" => Some(handle_exam_result(state, req)),
        "reports.grandTotal" => Some(handle_grand_total(state, req)),
        _ => None,
    }
}
