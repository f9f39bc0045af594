use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Term weights applied when combining exams into a grand total.
/// Defaults follow the usual annual split: two term exams at a quarter
/// each and the final at half.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermWeights {
    pub first: f64,
    pub second: f64,
    #[serde(rename = "final")]
    pub final_term: f64,
}

impl Default for TermWeights {
    fn default() -> Self {
        Self {
            first: 0.25,
            second: 0.25,
            final_term: 0.50,
        }
    }
}

impl TermWeights {
    pub fn is_valid(&self) -> bool {
        [self.first, self.second, self.final_term]
            .iter()
            .all(|w| w.is_finite() && (0.0..=1.0).contains(w))
    }
}

/// Legacy shim: infer a term weight from the exam name.
///
/// Exams created before the explicit `term_weight` column existed carry
/// their term only in free text ("1st Term", "Final Exam", ...). Matching
/// is case-insensitive substring search; names that match nothing weigh 0
/// and are excluded from any weighted aggregate. Prefer
/// [`weight_for_exam`], which only reaches for this when the explicit
/// field is absent.
pub fn weight_from_name(name: &str, weights: &TermWeights) -> f64 {
    let lower = name.to_lowercase();
    let has = |pats: &[&str]| pats.iter().any(|p| lower.contains(p));

    if has(&["final", "third", "term 3"]) {
        weights.final_term
    } else if has(&["2nd", "second", "term 2"]) {
        weights.second
    } else if has(&["1st", "first", "term 1"]) {
        weights.first
    } else {
        0.0
    }
}

pub fn weight_for_exam(term_weight: Option<f64>, name: &str, weights: &TermWeights) -> f64 {
    match term_weight {
        Some(w) if w.is_finite() && (0.0..=1.0).contains(&w) => w,
        _ => weight_from_name(name, weights),
    }
}

/// One band of a grade scale. `min_score..=max_score` is the score range;
/// `gpa` doubles as the minimum threshold for gpa-to-letter lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleBand {
    pub min_score: f64,
    pub max_score: f64,
    pub letter: String,
    pub gpa: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub letter: String,
    pub gpa: f64,
}

// Embedded defaults used when no scale is active. The score table and the
// gpa thresholds describe the same ladder.
const FALLBACK_GPA_LETTERS: &[(f64, &str)] = &[
    (5.00, "A+"),
    (4.00, "A"),
    (3.50, "A-"),
    (3.00, "B"),
    (2.00, "C"),
    (1.00, "D"),
];

const FALLBACK_SCORE_GRADES: &[(f64, &str, f64)] = &[
    (80.0, "A+", 5.0),
    (70.0, "A", 4.0),
    (60.0, "A-", 3.5),
    (50.0, "B", 3.0),
    (40.0, "C", 2.0),
    (33.0, "D", 1.0),
];

/// Resolve a letter from a gpa value: the band with the largest gpa
/// threshold not exceeding the input wins. Falls back to the embedded
/// table when no scale is supplied or no band matches. Non-finite input
/// resolves to the empty placeholder, never an error.
pub fn letter_for_gpa(gpa: f64, bands: &[ScaleBand]) -> String {
    if !gpa.is_finite() {
        return String::new();
    }

    let best = bands
        .iter()
        .filter(|b| b.gpa.is_finite() && b.gpa <= gpa)
        .max_by(|a, b| a.gpa.partial_cmp(&b.gpa).unwrap_or(Ordering::Equal));
    if let Some(band) = best {
        return band.letter.clone();
    }

    for (threshold, letter) in FALLBACK_GPA_LETTERS {
        if gpa >= *threshold {
            return (*letter).to_string();
        }
    }
    "F".to_string()
}

/// Resolve a letter and gpa from a raw score via the scale's score
/// ranges. Distinct from [`letter_for_gpa`]: this one matches
/// `min_score..=max_score`, not gpa thresholds.
pub fn grade_for_score(score: f64, bands: &[ScaleBand]) -> Grade {
    if !score.is_finite() {
        return Grade {
            letter: String::new(),
            gpa: 0.0,
        };
    }

    for band in bands {
        if band.min_score <= score && score <= band.max_score {
            return Grade {
                letter: band.letter.clone(),
                gpa: band.gpa,
            };
        }
    }

    for (min, letter, gpa) in FALLBACK_SCORE_GRADES {
        if score >= *min {
            return Grade {
                letter: (*letter).to_string(),
                gpa: *gpa,
            };
        }
    }
    Grade {
        letter: "F".to_string(),
        gpa: 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMark {
    pub score: f64,
    pub gpa: f64,
    pub letter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedMark {
    pub score: f64,
    pub gpa: f64,
    pub letter: String,
    pub exams_counted: usize,
}

/// Combine per-exam subject marks into a grand total.
///
/// For each subject, score and gpa sums accumulate only over the exams
/// where that subject actually has a mark, and the divisor is the sum of
/// those exams' weights: a missing mark shrinks the divisor instead of
/// counting as zero. Subjects with no marks across all weighted exams are
/// omitted entirely. Weight-0 exams never contribute.
pub fn combine_weighted(
    marks_by_exam: &[(f64, HashMap<String, SubjectMark>)],
    bands: &[ScaleBand],
) -> BTreeMap<String, CombinedMark> {
    struct Acc {
        score_sum: f64,
        gpa_sum: f64,
        weight_sum: f64,
        exams_counted: usize,
    }

    let mut acc: BTreeMap<String, Acc> = BTreeMap::new();
    for (weight, marks) in marks_by_exam {
        if !weight.is_finite() || *weight <= 0.0 {
            continue;
        }
        for (subject_id, mark) in marks {
            let entry = acc.entry(subject_id.clone()).or_insert(Acc {
                score_sum: 0.0,
                gpa_sum: 0.0,
                weight_sum: 0.0,
                exams_counted: 0,
            });
            entry.score_sum += mark.score * weight;
            entry.gpa_sum += mark.gpa * weight;
            entry.weight_sum += weight;
            entry.exams_counted += 1;
        }
    }

    acc.into_iter()
        .filter(|(_, a)| a.weight_sum > 0.0)
        .map(|(subject_id, a)| {
            let gpa = a.gpa_sum / a.weight_sum;
            let combined = CombinedMark {
                score: a.score_sum / a.weight_sum,
                gpa,
                letter: letter_for_gpa(gpa, bands),
                exams_counted: a.exams_counted,
            };
            (subject_id, combined)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub subject_count: usize,
    pub total_score: f64,
    pub average_score: f64,
    pub gpa: f64,
    pub letter: String,
}

/// Totals over (score, gpa) pairs. Empty input yields `None` so callers
/// can render dashes instead of a fabricated zero row.
pub fn summarize(pairs: &[(f64, f64)], bands: &[ScaleBand]) -> Option<ResultSummary> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let total_score: f64 = pairs.iter().map(|(s, _)| s).sum();
    let gpa = pairs.iter().map(|(_, g)| g).sum::<f64>() / n;
    Some(ResultSummary {
        subject_count: pairs.len(),
        total_score,
        average_score: total_score / n,
        gpa,
        letter: letter_for_gpa(gpa, bands),
    })
}

/// 2-decimal presentation rounding for report payloads:
/// `Int(100*x + 0.5) / 100`. The core keeps full precision; only the
/// wire models round.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}
