use crate::grading::ScaleBand;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "resultd.sqlite3";
pub const TERM_WEIGHTS_KEY: &str = "grading.term_weights";

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            roll_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cohort ON students(class_id, section_id, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            term_weight REAL,
            is_published INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    // Workspaces from before the explicit weight column infer weights
    // from exam names until the rows are updated.
    ensure_exams_term_weight(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_cohort ON exams(class_id, section_id, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(exam_id, student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_exam ON marks(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // At most one active scale, enforced by the store itself rather than
    // by UI convention.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grade_scales_single_active
         ON grade_scales(is_active) WHERE is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            scale_id TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            letter TEXT NOT NULL,
            gpa REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(scale_id) REFERENCES grade_scales(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_scale ON grade_bands(scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_exams_term_weight(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "term_weight")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exams ADD COLUMN term_weight REAL", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Bands of the active scale, sorted for range lookups. Empty when no
/// scale is active; resolvers then use their embedded fallback tables.
pub fn active_scale_bands(conn: &Connection) -> rusqlite::Result<Vec<ScaleBand>> {
    let scale_id: Option<String> = conn
        .query_row("SELECT id FROM grade_scales WHERE is_active = 1", [], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(scale_id) = scale_id else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(
        "SELECT min_score, max_score, letter, gpa
         FROM grade_bands
         WHERE scale_id = ?
         ORDER BY min_score",
    )?;
    let bands = stmt
        .query_map([&scale_id], |r| {
            Ok(ScaleBand {
                min_score: r.get(0)?,
                max_score: r.get(1)?,
                letter: r.get(2)?,
                gpa: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bands)
}

/// Term weights from settings, falling back to the defaults when the key
/// is absent or malformed.
pub fn term_weights(conn: &Connection) -> crate::grading::TermWeights {
    settings_get_json(conn, TERM_WEIGHTS_KEY)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value::<crate::grading::TermWeights>(v).ok())
        .filter(|w| w.is_valid())
        .unwrap_or_default()
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}
