use crate::bands::{self, BandRow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_band_rows(value: Option<&serde_json::Value>) -> Result<Vec<BandRow>, String> {
    let Some(value) = value else {
        return Err("missing bands[]".to_string());
    };
    if !value.is_array() {
        return Err("bands must be an array".to_string());
    }
    serde_json::from_value(value.clone()).map_err(|e| format!("bands[] malformed: {}", e))
}

fn validation_details(errors: &[bands::RowErrors]) -> serde_json::Value {
    json!({
        "rows": errors
            .iter()
            .map(|e| json!({ "row": e.row, "codes": e.codes }))
            .collect::<Vec<_>>(),
    })
}

fn insert_bands(
    conn: &Connection,
    scale_id: &str,
    rows: &[BandRow],
) -> Result<usize, rusqlite::Error> {
    let mut inserted = 0;
    for (i, row) in rows.iter().enumerate() {
        if row.deleted {
            continue;
        }
        conn.execute(
            "INSERT INTO grade_bands(id, scale_id, min_score, max_score, letter, gpa, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                scale_id,
                row.min_score.unwrap_or(0.0),
                row.max_score.unwrap_or(0.0),
                row.letter.as_deref().unwrap_or("").trim(),
                row.gpa.unwrap_or(0.0),
                i as i64,
            ),
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

fn handle_scales_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let rows = match parse_band_rows(req.params.get("bands")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let errors = bands::validate_bands(&rows);
    if !bands::bands_savable(&rows, &errors) {
        return err(
            &req.id,
            "invalid_bands",
            "bands failed validation",
            Some(validation_details(&errors)),
        );
    }

    let scale_id = Uuid::new_v4().to_string();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO grade_scales(id, name, is_active) VALUES(?, ?, 0)",
        (&scale_id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = insert_bands(&tx, &scale_id, &rows) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "scaleId": scale_id }))
}

fn handle_scales_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut scales_stmt =
        match conn.prepare("SELECT id, name, is_active FROM grade_scales ORDER BY name, id") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let scales = scales_stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let scales = match scales {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut bands_stmt = match conn.prepare(
        "SELECT min_score, max_score, letter, gpa
         FROM grade_bands
         WHERE scale_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = Vec::with_capacity(scales.len());
    for (scale_id, name, is_active) in scales {
        let bands = bands_stmt
            .query_map([&scale_id], |r| {
                Ok(json!({
                    "minScore": r.get::<_, f64>(0)?,
                    "maxScore": r.get::<_, f64>(1)?,
                    "letter": r.get::<_, String>(2)?,
                    "gpa": r.get::<_, f64>(3)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let bands = match bands {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        out.push(json!({
            "scaleId": scale_id,
            "name": name,
            "isActive": is_active,
            "bands": bands,
        }));
    }

    ok(&req.id, json!({ "scales": out }))
}

fn handle_scales_save_bands(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let scale_id = match req.params.get("scaleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing scaleId", None),
    };
    let rows = match parse_band_rows(req.params.get("bands")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM grade_scales WHERE id = ?", [&scale_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "grade scale not found", None);
    }

    // Nothing persists unless every row is clean; the caller renders the
    // per-row codes against its editor rows.
    let errors = bands::validate_bands(&rows);
    if !bands::bands_savable(&rows, &errors) {
        return err(
            &req.id,
            "invalid_bands",
            "bands failed validation",
            Some(validation_details(&errors)),
        );
    }

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grade_bands WHERE scale_id = ?", [&scale_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let inserted = match insert_bands(&tx, &scale_id, &rows) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "scaleId": scale_id, "bands": inserted }))
}

fn handle_scales_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let scale_id = match req.params.get("scaleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing scaleId", None),
    };

    // One transactional swap: the store never holds two active scales,
    // and a failed activation leaves the previous one in place.
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let exists: Option<i64> = match tx
        .query_row("SELECT 1 FROM grade_scales WHERE id = ?", [&scale_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "grade scale not found", None);
    }
    if let Err(e) = tx.execute("UPDATE grade_scales SET is_active = 0 WHERE is_active = 1", []) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE grade_scales SET is_active = 1 WHERE id = ?",
        [&scale_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "scaleId": scale_id, "isActive": true }))
}

fn handle_scales_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let scale_id = match req.params.get("scaleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing scaleId", None),
    };

    let is_active: Option<i64> = match conn
        .query_row(
            "SELECT is_active FROM grade_scales WHERE id = ?",
            [&scale_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(is_active) = is_active else {
        return err(&req.id, "not_found", "grade scale not found", None);
    };
    if is_active != 0 {
        return err(
            &req.id,
            "scale_active",
            "deactivate the scale before deleting it",
            Some(json!({ "scaleId": scale_id })),
        );
    }

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grade_bands WHERE scale_id = ?", [&scale_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM grade_scales WHERE id = ?", [&scale_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "scaleId": scale_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scales.create" => Some(handle_scales_create(state, req)),
        "scales.list" => Some(handle_scales_list(state, req)),
        "scales.saveBands" => Some(handle_scales_save_bands(state, req)),
        "scales.activate" => Some(handle_scales_activate(state, req)),
        "scales.delete" => Some(handle_scales_delete(state, req)),
        _ => None,
    }
}
