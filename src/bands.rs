use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const ERR_MIN_OUT_OF_RANGE: &str = "min_out_of_range";
pub const ERR_MAX_OUT_OF_RANGE: &str = "max_out_of_range";
pub const ERR_MIN_ABOVE_MAX: &str = "min_above_max";
pub const ERR_LETTER_EMPTY: &str = "letter_empty";
pub const ERR_GPA_INVALID: &str = "gpa_invalid";
pub const ERR_OVERLAP: &str = "overlap";

/// One authored band row. Rows flagged `deleted` are kept in the request
/// so error reports stay index-aligned with the editor, but they are
/// excluded from range and overlap checks and never persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandRow {
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub letter: Option<String>,
    pub gpa: Option<f64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowErrors {
    pub row: usize,
    pub codes: Vec<&'static str>,
}

impl RowErrors {
    fn push(&mut self, code: &'static str) {
        if !self.codes.contains(&code) {
            self.codes.push(code);
        }
    }
}

fn in_score_range(v: f64) -> bool {
    v.is_finite() && (0.0..=100.0).contains(&v)
}

/// Validate authored bands. Returns one entry per input row, empty when
/// the row is clean. Overlapping pairs flag both rows involved.
pub fn validate_bands(rows: &[BandRow]) -> Vec<RowErrors> {
    let mut errors: Vec<RowErrors> = (0..rows.len())
        .map(|row| RowErrors { row, codes: vec![] })
        .collect();

    for (i, band) in rows.iter().enumerate() {
        if band.deleted {
            continue;
        }

        let min_ok = matches!(band.min_score, Some(v) if in_score_range(v));
        if !min_ok {
            errors[i].push(ERR_MIN_OUT_OF_RANGE);
        }
        let max_ok = matches!(band.max_score, Some(v) if in_score_range(v));
        if !max_ok {
            errors[i].push(ERR_MAX_OUT_OF_RANGE);
        }
        if let (true, true, Some(min), Some(max)) = (min_ok, max_ok, band.min_score, band.max_score)
        {
            if min > max {
                errors[i].push(ERR_MIN_ABOVE_MAX);
            }
        }

        if band
            .letter
            .as_deref()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
        {
            errors[i].push(ERR_LETTER_EMPTY);
        }

        if !matches!(band.gpa, Some(v) if v.is_finite()) {
            errors[i].push(ERR_GPA_INVALID);
        }
    }

    // Overlap sweep over the rows that passed every per-band check,
    // sorted by min ascending. A pair overlaps when the lower band's max
    // reaches into the next band's range.
    let mut sortable: Vec<(usize, f64, f64)> = rows
        .iter()
        .enumerate()
        .filter(|(i, band)| !band.deleted && errors[*i].codes.is_empty())
        .map(|(i, band)| {
            (
                i,
                band.min_score.unwrap_or(0.0),
                band.max_score.unwrap_or(0.0),
            )
        })
        .collect();
    sortable.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    for pair in sortable.windows(2) {
        let (prev_row, _, prev_max) = pair[0];
        let (next_row, next_min, _) = pair[1];
        if prev_max >= next_min {
            errors[prev_row].push(ERR_OVERLAP);
            errors[next_row].push(ERR_OVERLAP);
        }
    }

    errors
}

/// A scale is savable only when every row is clean and at least one
/// non-deleted band remains.
pub fn bands_savable(rows: &[BandRow], errors: &[RowErrors]) -> bool {
    errors.iter().all(|e| e.codes.is_empty()) && rows.iter().any(|r| !r.deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(min: f64, max: f64, letter: &str, gpa: f64) -> BandRow {
        BandRow {
            min_score: Some(min),
            max_score: Some(max),
            letter: Some(letter.to_string()),
            gpa: Some(gpa),
            deleted: false,
        }
    }

    #[test]
    fn overlap_flags_both_rows() {
        let rows = vec![row(0.0, 50.0, "F", 0.0), row(40.0, 100.0, "A", 5.0)];
        let errors = validate_bands(&rows);
        assert_eq!(errors[0].codes, vec![ERR_OVERLAP]);
        assert_eq!(errors[1].codes, vec![ERR_OVERLAP]);
        assert!(!bands_savable(&rows, &errors));
    }

    #[test]
    fn touching_edges_count_as_overlap() {
        let rows = vec![row(0.0, 50.0, "F", 0.0), row(50.0, 100.0, "A", 5.0)];
        let errors = validate_bands(&rows);
        assert!(errors[0].codes.contains(&ERR_OVERLAP));
        assert!(errors[1].codes.contains(&ERR_OVERLAP));

        let rows = vec![row(0.0, 49.9, "F", 0.0), row(50.0, 100.0, "A", 5.0)];
        let errors = validate_bands(&rows);
        assert!(errors.iter().all(|e| e.codes.is_empty()));
        assert!(bands_savable(&rows, &errors));
    }

    #[test]
    fn per_band_checks_catch_each_field() {
        let rows = vec![
            row(-1.0, 50.0, "F", 0.0),
            row(0.0, 101.0, "D", 1.0),
            row(60.0, 40.0, "C", 2.0),
            row(70.0, 80.0, "   ", 3.0),
            BandRow {
                min_score: Some(85.0),
                max_score: Some(100.0),
                letter: Some("A+".into()),
                gpa: Some(f64::NAN),
                deleted: false,
            },
            BandRow::default(),
        ];
        let errors = validate_bands(&rows);
        assert!(errors[0].codes.contains(&ERR_MIN_OUT_OF_RANGE));
        assert!(errors[1].codes.contains(&ERR_MAX_OUT_OF_RANGE));
        assert!(errors[2].codes.contains(&ERR_MIN_ABOVE_MAX));
        assert!(errors[3].codes.contains(&ERR_LETTER_EMPTY));
        assert!(errors[4].codes.contains(&ERR_GPA_INVALID));
        assert!(errors[5].codes.contains(&ERR_MIN_OUT_OF_RANGE));
        assert!(errors[5].codes.contains(&ERR_MAX_OUT_OF_RANGE));
        assert!(errors[5].codes.contains(&ERR_LETTER_EMPTY));
        assert!(errors[5].codes.contains(&ERR_GPA_INVALID));
        assert!(!bands_savable(&rows, &errors));
    }

    #[test]
    fn deleted_rows_keep_their_index_but_skip_checks() {
        let mut middle = row(0.0, 100.0, "X", 1.0);
        middle.deleted = true;
        let rows = vec![row(0.0, 49.0, "F", 0.0), middle, row(50.0, 100.0, "A", 5.0)];
        let errors = validate_bands(&rows);
        assert_eq!(errors.len(), 3);
        // The deleted row would overlap everything; it must not count.
        assert!(errors.iter().all(|e| e.codes.is_empty()));
        assert_eq!(errors[1].row, 1);
        assert!(bands_savable(&rows, &errors));
    }

    #[test]
    fn all_rows_deleted_is_not_savable() {
        let mut a = row(0.0, 49.0, "F", 0.0);
        a.deleted = true;
        let rows = vec![a];
        let errors = validate_bands(&rows);
        assert!(errors.iter().all(|e| e.codes.is_empty()));
        assert!(!bands_savable(&rows, &errors));
    }

    #[test]
    fn invalid_rows_are_excluded_from_the_overlap_sweep() {
        // The middle row fails its range check; only the two clean rows
        // are compared, and they do not overlap.
        let rows = vec![
            row(0.0, 49.0, "F", 0.0),
            row(-5.0, 200.0, "?", f64::NAN),
            row(50.0, 100.0, "A", 5.0),
        ];
        let errors = validate_bands(&rows);
        assert!(errors[0].codes.is_empty());
        assert!(!errors[1].codes.is_empty());
        assert!(!errors[1].codes.contains(&ERR_OVERLAP));
        assert!(errors[2].codes.is_empty());
    }
}
