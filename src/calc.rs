use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const SEMESTER_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GradeError {
    #[error("score must be a finite number")]
    NonFiniteScore,
    #[error("score {0} is outside 0..=100")]
    ScoreOutOfRange(f64),
    #[error("semester {0} is outside 1..=5")]
    InvalidSemester(i64),
    #[error("cannot {action} an entry that is {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
    #[error("rejection note must not be empty")]
    EmptyRejectionNote,
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NonFiniteScore | Self::ScoreOutOfRange(_) => "invalid_score",
            Self::InvalidSemester(_) => "invalid_semester",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::EmptyRejectionNote => "bad_params",
        }
    }
}

/// Half-up rounding to 2 decimals, the precision scores are stored and shown with.
/// Scaling goes through the shortest decimal form of `x`, so `1.005` rounds to
/// `1.01` even though its binary value sits just below it.
pub fn round_off_2_decimal(x: f64) -> f64 {
    let scaled: f64 = format!("{}e2", x).parse().unwrap_or(100.0 * x);
    (scaled + 0.5).floor() / 100.0
}

/// A validated score in `0..=100`. Absence is modelled as `Option<Score>`, never as zero.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Result<Self, GradeError> {
        if !value.is_finite() {
            return Err(GradeError::NonFiniteScore);
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(GradeError::ScoreOutOfRange(value));
        }
        Ok(Self(round_off_2_decimal(value)))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Score {
    type Error = GradeError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for f64 {
    fn from(s: Score) -> f64 {
        s.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Semester(u8);

impl Semester {
    pub fn new(n: i64) -> Result<Self, GradeError> {
        if (1..=SEMESTER_COUNT as i64).contains(&n) {
            Ok(Self(n as u8))
        } else {
            Err(GradeError::InvalidSemester(n))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn all() -> Vec<Semester> {
        (1..=SEMESTER_COUNT as u8).map(Semester).collect()
    }

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<i64> for Semester {
    type Error = GradeError;

    fn try_from(n: i64) -> Result<Self, Self::Error> {
        Self::new(n)
    }
}

impl From<Semester> for i64 {
    fn from(s: Semester) -> i64 {
        s.0 as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min: f64,
    pub max: f64,
    pub letter: &'static str,
    pub category: &'static str,
    pub color: &'static str,
}

/// Ordered highest to lowest. `max` is the printed 2-decimal bound; membership
/// is decided by the next band's `min` so every real in 0..=100 has exactly one band.
pub const GRADE_BANDS: [GradeBand; 9] = [
    GradeBand { min: 95.0, max: 100.0, letter: "A+", category: "Outstanding", color: "#15803d" },
    GradeBand { min: 90.0, max: 94.99, letter: "A", category: "Excellent", color: "#16a34a" },
    GradeBand { min: 85.0, max: 89.99, letter: "B+", category: "Very Good", color: "#65a30d" },
    GradeBand { min: 80.0, max: 84.99, letter: "B", category: "Good", color: "#84cc16" },
    GradeBand { min: 75.0, max: 79.99, letter: "C+", category: "Fairly Good", color: "#ca8a04" },
    GradeBand { min: 70.0, max: 74.99, letter: "C", category: "Sufficient", color: "#eab308" },
    GradeBand { min: 65.0, max: 69.99, letter: "D+", category: "Below Average", color: "#f97316" },
    GradeBand { min: 60.0, max: 64.99, letter: "D", category: "Poor", color: "#ea580c" },
    GradeBand { min: 0.0, max: 59.99, letter: "E", category: "Failing", color: "#dc2626" },
];

impl GradeBand {
    pub fn contains(&self, score: f64) -> bool {
        if score < self.min || score > 100.0 {
            return false;
        }
        match GRADE_BANDS.iter().filter(|b| b.min > self.min).last() {
            Some(higher) => score < higher.min,
            None => true,
        }
    }
}

pub fn resolve_band(score: Score) -> &'static GradeBand {
    GRADE_BANDS
        .iter()
        .find(|b| b.contains(score.value()))
        .unwrap_or(&GRADE_BANDS[GRADE_BANDS.len() - 1])
}

/// Band for a computed average; `None` when the value is not a valid score.
pub fn band_for(value: f64) -> Option<&'static GradeBand> {
    Score::new(value).ok().map(resolve_band)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    pub subject_id: String,
    pub name: String,
    #[serde(default)]
    pub scores: [Option<Score>; SEMESTER_COUNT],
}

impl SubjectRecord {
    pub fn new(subject_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            name: name.into(),
            scores: [None; SEMESTER_COUNT],
        }
    }

    pub fn score(&self, semester: Semester) -> Option<Score> {
        self.scores[semester.index()]
    }

    pub fn set_score(&mut self, semester: Semester, score: Option<Score>) {
        self.scores[semester.index()] = score;
    }
}

fn present_scores<'a>(
    record: &'a SubjectRecord,
    semesters: &'a [Semester],
) -> impl Iterator<Item = Score> + 'a {
    let mut seen = BTreeSet::new();
    semesters
        .iter()
        .copied()
        .filter(move |s| seen.insert(*s))
        .filter_map(|s| record.score(s))
}

/// Mean of the present scores in `semesters`; 0 when none is present.
pub fn subject_average(record: &SubjectRecord, semesters: &[Semester]) -> f64 {
    let (sum, count) = present_scores(record, semesters)
        .fold((0.0_f64, 0_usize), |(sum, n), s| (sum + s.value(), n + 1));
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

pub fn subject_has_data(record: &SubjectRecord, semesters: &[Semester]) -> bool {
    present_scores(record, semesters).next().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterAverage {
    pub semester: Semester,
    pub average: f64,
    pub subject_count: usize,
}

/// Per-semester mean across subjects. Semesters where no subject has a score are skipped.
pub fn semester_averages(records: &[SubjectRecord], semesters: &[Semester]) -> Vec<SemesterAverage> {
    let unique: BTreeSet<Semester> = semesters.iter().copied().collect();
    unique
        .into_iter()
        .filter_map(|sem| {
            let values: Vec<f64> = records
                .iter()
                .filter_map(|r| r.score(sem))
                .map(Score::value)
                .collect();
            if values.is_empty() {
                return None;
            }
            Some(SemesterAverage {
                semester: sem,
                average: values.iter().sum::<f64>() / values.len() as f64,
                subject_count: values.len(),
            })
        })
        .collect()
}

/// Average of semester averages, each semester weighted equally regardless of
/// how many subjects it holds. 0 when no semester has data.
pub fn overall_average_for(records: &[SubjectRecord], semesters: &[Semester]) -> f64 {
    let per_semester = semester_averages(records, semesters);
    if per_semester.is_empty() {
        return 0.0;
    }
    per_semester.iter().map(|s| s.average).sum::<f64>() / per_semester.len() as f64
}

pub fn overall_average(records: &[SubjectRecord]) -> f64 {
    overall_average_for(records, &Semester::all())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject_id: String,
    pub name: String,
    pub scores: [Option<Score>; SEMESTER_COUNT],
    pub average: f64,
    pub has_data: bool,
    pub band: Option<GradeBand>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub semesters: Vec<Semester>,
    pub subjects: Vec<SubjectSummary>,
    pub semester_averages: Vec<SemesterAverage>,
    pub overall_average: f64,
    pub overall_band: Option<GradeBand>,
    pub has_data: bool,
}

/// Report-card view over `semesters`. Averages are rounded for display and bands
/// are resolved from the rounded value; no band is given where there is no data.
pub fn summarize(records: &[SubjectRecord], semesters: &[Semester]) -> RecordSummary {
    let subjects: Vec<SubjectSummary> = records
        .iter()
        .map(|r| {
            let has_data = subject_has_data(r, semesters);
            let average = round_off_2_decimal(subject_average(r, semesters));
            SubjectSummary {
                subject_id: r.subject_id.clone(),
                name: r.name.clone(),
                scores: r.scores,
                average,
                has_data,
                band: if has_data { band_for(average).copied() } else { None },
            }
        })
        .collect();

    let mut per_semester = semester_averages(records, semesters);
    let has_data = !per_semester.is_empty();
    let overall = round_off_2_decimal(overall_average_for(records, semesters));
    for s in &mut per_semester {
        s.average = round_off_2_decimal(s.average);
    }

    let mut listed: Vec<Semester> = semesters.to_vec();
    listed.sort();
    listed.dedup();

    RecordSummary {
        semesters: listed,
        subjects,
        semester_averages: per_semester,
        overall_average: overall,
        overall_band: if has_data { band_for(overall).copied() } else { None },
        has_data,
    }
}
