use crate::db;
use crate::grading::{self, CombinedMark, ScaleBand, SubjectMark};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("mark store unavailable: {0}")]
    Unavailable(String),
    #[error("mark query failed: {0}")]
    Query(String),
}

/// Read side of the mark store: one read per (exam, student). Injected so
/// aggregation is testable without a workspace behind it.
pub trait MarkSource: Sync {
    fn subject_marks(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<HashMap<String, SubjectMark>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct WeightedExam {
    pub exam_id: String,
    pub weight: f64,
}

/// Monotonic generation counter for fetch batches. A batch begun for one
/// selection is discarded if another selection begins before it joins.
#[derive(Debug, Default)]
pub struct SelectionSeq(AtomicU64);

impl SelectionSeq {
    pub fn begin(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.0.load(Ordering::SeqCst) == generation
    }
}

/// A failed fetch degrades to "no marks for this exam". Partial data must
/// still render, so the error stops here.
fn fetch_or_empty<S: MarkSource + ?Sized>(
    source: &S,
    exam_id: &str,
    student_id: &str,
) -> HashMap<String, SubjectMark> {
    match source.subject_marks(exam_id, student_id) {
        Ok(marks) => marks,
        Err(e) => {
            tracing::warn!(exam_id, student_id, error = %e, "mark fetch failed; exam treated as empty");
            HashMap::new()
        }
    }
}

/// Fan out one fetch per exam and join. Every fetch writes its own
/// pre-allocated slot, so the threads share nothing mutable.
pub fn fetch_weighted_marks<S: MarkSource>(
    source: &S,
    exams: &[WeightedExam],
    student_id: &str,
) -> Vec<(f64, HashMap<String, SubjectMark>)> {
    let mut slots: Vec<HashMap<String, SubjectMark>> = Vec::with_capacity(exams.len());
    slots.resize_with(exams.len(), HashMap::new);

    std::thread::scope(|scope| {
        for (slot, exam) in slots.iter_mut().zip(exams.iter()) {
            scope.spawn(move || {
                *slot = fetch_or_empty(source, &exam.exam_id, student_id);
            });
        }
    });

    exams.iter().map(|e| e.weight).zip(slots).collect()
}

/// Fetch, join, and combine for one student. Returns `None` when the
/// selection moved on while the batch was in flight; the caller drops the
/// stale result instead of rendering it.
pub fn grand_total<S: MarkSource>(
    source: &S,
    selection: &SelectionSeq,
    generation: u64,
    exams: &[WeightedExam],
    student_id: &str,
    bands: &[ScaleBand],
) -> Option<BTreeMap<String, CombinedMark>> {
    let fetched = fetch_weighted_marks(source, exams, student_id);
    if !selection.is_current(generation) {
        return None;
    }
    Some(grading::combine_weighted(&fetched, bands))
}

/// Mark store backed by the workspace database. Each fetch opens its own
/// connection; the active-scale bands are snapshotted at construction so
/// one batch derives every grade against the same scale.
pub struct SqliteMarkSource {
    db_path: PathBuf,
    bands: Vec<ScaleBand>,
}

impl SqliteMarkSource {
    pub fn new(workspace: &Path, bands: Vec<ScaleBand>) -> Self {
        Self {
            db_path: workspace.join(db::DB_FILE_NAME),
            bands,
        }
    }
}

impl MarkSource for SqliteMarkSource {
    fn subject_marks(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<HashMap<String, SubjectMark>, FetchError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT subject_id, score FROM marks WHERE exam_id = ? AND student_id = ?")
            .map_err(|e| FetchError::Query(e.to_string()))?;
        let rows = stmt
            .query_map((exam_id, student_id), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| FetchError::Query(e.to_string()))?;

        let mut out = HashMap::with_capacity(rows.len());
        for (subject_id, score) in rows {
            let grade = grading::grade_for_score(score, &self.bands);
            out.insert(
                subject_id,
                SubjectMark {
                    score,
                    gpa: grade.gpa,
                    letter: grade.letter,
                },
            );
        }
        Ok(out)
    }
}
