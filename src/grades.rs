use crate::calc::{GradeError, Score, Semester, SubjectRecord};
use crate::ranking::NamedRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Validated,
    Rejected,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "validated" => Some(Self::Validated),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Status after a (re)submission. Validated entries are final; rejected ones
    /// may come back only when resubmission is allowed.
    pub fn submit(current: Option<Self>, allow_resubmit: bool) -> Result<Self, GradeError> {
        match current {
            None | Some(Self::Pending) => Ok(Self::Pending),
            Some(Self::Rejected) if allow_resubmit => Ok(Self::Pending),
            Some(from) => Err(GradeError::InvalidTransition {
                from: from.as_str(),
                action: "resubmit",
            }),
        }
    }

    pub fn validate(self) -> Result<Self, GradeError> {
        match self {
            Self::Pending => Ok(Self::Validated),
            from => Err(GradeError::InvalidTransition {
                from: from.as_str(),
                action: "validate",
            }),
        }
    }

    pub fn reject(self, note: &str) -> Result<Self, GradeError> {
        if note.trim().is_empty() {
            return Err(GradeError::EmptyRejectionNote);
        }
        match self {
            Self::Pending => Ok(Self::Rejected),
            from => Err(GradeError::InvalidTransition {
                from: from.as_str(),
                action: "reject",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub semester: Semester,
    pub value: Score,
    pub status: EntryStatus,
    pub note: Option<String>,
    pub submitted_at: String,
    pub reviewed_at: Option<String>,
}

/// Folds a student's validated entries into one record per subject. Subjects
/// follow `subjects` order; unknown subject ids are appended in first-seen order.
pub fn records_from_entries(entries: &[GradeEntry], subjects: &[NamedRef]) -> Vec<SubjectRecord> {
    let mut records: Vec<SubjectRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let validated = entries.iter().filter(|e| e.status == EntryStatus::Validated);
    let mut used: Vec<&GradeEntry> = validated.collect();
    let position = |id: &str| subjects.iter().position(|s| s.id == id).unwrap_or(usize::MAX);
    used.sort_by_key(|e| position(&e.subject_id));

    for e in used {
        let slot = *index.entry(e.subject_id.clone()).or_insert_with(|| {
            let name = subjects
                .iter()
                .find(|s| s.id == e.subject_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| e.subject_id.clone());
            records.push(SubjectRecord::new(e.subject_id.clone(), name));
            records.len() - 1
        });
        records[slot].set_score(e.semester, Some(e.value));
    }
    records
}
