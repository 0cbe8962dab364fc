use crate::calc::Semester;
use crate::grades::{EntryStatus, GradeEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Level, major or subject as the filter controls see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    pub name: String,
    pub level_id: String,
    pub major_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub class_id: Option<String>,
}

/// Every field is optional; `None` means no constraint on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingFilter {
    pub class_id: Option<String>,
    pub major_id: Option<String>,
    pub level_id: Option<String>,
    pub semester: Option<Semester>,
    pub subject_id: Option<String>,
}

/// Trimmed text of a filter value. Absent, null, blank and `"ALL"` mean no
/// selection; a value that is not a string comes back as `Err`.
fn selected_text(v: Option<&serde_json::Value>) -> Result<Option<&str>, &serde_json::Value> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) => {
                let t = s.trim();
                Ok((!t.is_empty() && !t.eq_ignore_ascii_case("ALL")).then_some(t))
            }
            None => Err(v),
        },
    }
}

fn filter_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, String> {
    selected_text(obj.get(key))
        .map(|t| t.map(str::to_string))
        .map_err(|_| format!("filters.{} must be string or null", key))
}

fn filter_semester(n: Option<i64>) -> Result<Semester, String> {
    let n = n.ok_or_else(|| "filters.semester must be integer or 'ALL'".to_string())?;
    Semester::new(n).map_err(|e| e.to_string())
}

pub fn parse_ranking_filter(raw: Option<&serde_json::Value>) -> Result<RankingFilter, String> {
    let Some(raw) = raw else {
        return Ok(RankingFilter::default());
    };
    if raw.is_null() {
        return Ok(RankingFilter::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err("filters must be an object".to_string());
    };

    let semester = match selected_text(obj.get("semester")) {
        Ok(None) => None,
        Ok(Some(t)) => Some(filter_semester(t.parse().ok())?),
        Err(v) => Some(filter_semester(v.as_i64())?),
    };

    Ok(RankingFilter {
        class_id: filter_str(obj, "classId")?,
        major_id: filter_str(obj, "majorId")?,
        level_id: filter_str(obj, "levelId")?,
        semester,
        subject_id: filter_str(obj, "subjectId")?,
    })
}

/// Lookup tables for resolving an entry's student to its class, level and major.
/// Entries of students missing from the roster never rank.
pub struct Roster<'a> {
    students: HashMap<&'a str, &'a StudentRef>,
    classes: HashMap<&'a str, &'a ClassRef>,
}

impl<'a> Roster<'a> {
    pub fn new(students: &'a [StudentRef], classes: &'a [ClassRef]) -> Self {
        Self {
            students: students.iter().map(|s| (s.id.as_str(), s)).collect(),
            classes: classes.iter().map(|c| (c.id.as_str(), c)).collect(),
        }
    }

    fn class_of(&self, student_id: &str) -> Option<&'a ClassRef> {
        let student = self.students.get(student_id)?;
        let class_id = student.class_id.as_deref()?;
        self.classes.get(class_id).copied()
    }
}

fn entry_matches(entry: &GradeEntry, roster: &Roster<'_>, filter: &RankingFilter) -> bool {
    if entry.status != EntryStatus::Validated {
        return false;
    }
    if filter.semester.map(|s| s != entry.semester).unwrap_or(false) {
        return false;
    }
    if let Some(subject_id) = &filter.subject_id {
        if entry.subject_id != *subject_id {
            return false;
        }
    }
    if !roster.students.contains_key(entry.student_id.as_str()) {
        return false;
    }
    if filter.class_id.is_none() && filter.level_id.is_none() && filter.major_id.is_none() {
        return true;
    }
    let Some(class) = roster.class_of(&entry.student_id) else {
        return false;
    };
    let class_ok = filter.class_id.as_ref().map(|c| class.id == *c).unwrap_or(true);
    let level_ok = filter
        .level_id
        .as_ref()
        .map(|l| class.level_id == *l)
        .unwrap_or(true);
    let major_ok = filter
        .major_id
        .as_ref()
        .map(|m| class.major_id.as_deref() == Some(m.as_str()))
        .unwrap_or(true);
    class_ok && level_ok && major_ok
}

/// Validated entries matching every active filter.
pub fn filter_entries<'e>(
    entries: &'e [GradeEntry],
    roster: &Roster<'_>,
    filter: &RankingFilter,
) -> Vec<&'e GradeEntry> {
    entries
        .iter()
        .filter(|e| entry_matches(e, roster, filter))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    pub rank: usize,
    pub student_id: String,
    pub student_name: String,
    pub class_id: Option<String>,
    pub average: f64,
    pub entry_count: usize,
}

/// Flat mean of each student's matching validated entries, best first.
/// Equal averages fall back to student name (case-insensitive), then id.
pub fn rank_students(
    entries: &[GradeEntry],
    roster: &Roster<'_>,
    filter: &RankingFilter,
) -> Vec<RankingEntry> {
    let mut order: Vec<&str> = Vec::new();
    let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
    for e in filter_entries(entries, roster, filter) {
        let slot = totals.entry(e.student_id.as_str()).or_insert_with(|| {
            order.push(e.student_id.as_str());
            (0.0, 0)
        });
        slot.0 += e.value.value();
        slot.1 += 1;
    }

    let mut rows: Vec<RankingEntry> = order
        .into_iter()
        .map(|student_id| {
            let (sum, count) = totals[student_id];
            let student = roster.students.get(student_id);
            RankingEntry {
                rank: 0,
                student_id: student_id.to_string(),
                student_name: student
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| student_id.to_string()),
                class_id: student.and_then(|s| s.class_id.clone()),
                average: sum / count as f64,
                entry_count: count,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.student_name
                    .to_lowercase()
                    .cmp(&b.student_name.to_lowercase())
            })
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}

/// The level → major → class selection of the filter controls.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSelection {
    pub level_id: Option<String>,
    pub major_id: Option<String>,
    pub class_id: Option<String>,
}

pub struct FilterOptions<'a> {
    majors: &'a [NamedRef],
    classes: &'a [ClassRef],
}

impl<'a> FilterOptions<'a> {
    pub fn new(majors: &'a [NamedRef], classes: &'a [ClassRef]) -> Self {
        Self { majors, classes }
    }

    /// Majors used by at least one class at `level_id`; all majors without a level.
    pub fn majors(&self, level_id: Option<&str>) -> Vec<&'a NamedRef> {
        let classes = self.classes;
        self.majors
            .iter()
            .filter(|m| match level_id {
                None => true,
                Some(level) => classes
                    .iter()
                    .any(|c| c.level_id == level && c.major_id.as_deref() == Some(m.id.as_str())),
            })
            .collect()
    }

    pub fn classes(&self, level_id: Option<&str>, major_id: Option<&str>) -> Vec<&'a ClassRef> {
        self.classes
            .iter()
            .filter(|c| level_id.map(|l| c.level_id == l).unwrap_or(true))
            .filter(|c| major_id.map(|m| c.major_id.as_deref() == Some(m)).unwrap_or(true))
            .collect()
    }

    fn major_allowed(&self, level_id: Option<&str>, major_id: &str) -> bool {
        self.majors(level_id).iter().any(|m| m.id == major_id)
    }

    fn class_allowed(&self, level_id: Option<&str>, major_id: Option<&str>, class_id: &str) -> bool {
        self.classes(level_id, major_id).iter().any(|c| c.id == class_id)
    }
}

impl FilterSelection {
    /// Clearing the level clears major and class. A new level keeps them only
    /// while they remain selectable.
    pub fn set_level(&mut self, level_id: Option<String>, options: &FilterOptions<'_>) {
        match level_id {
            None => {
                self.level_id = None;
                self.major_id = None;
                self.class_id = None;
            }
            Some(level) => {
                self.level_id = Some(level);
                self.revalidate_major(options);
            }
        }
    }

    pub fn set_major(&mut self, major_id: Option<String>, options: &FilterOptions<'_>) {
        match major_id {
            None => {
                self.major_id = None;
                self.class_id = None;
            }
            Some(major) => {
                self.major_id = Some(major);
                self.revalidate_major(options);
            }
        }
    }

    pub fn set_class(&mut self, class_id: Option<String>, options: &FilterOptions<'_>) {
        self.class_id = class_id;
        self.revalidate_class(options);
    }

    /// Rebuilds a selection top-down so it is consistent with the cascade.
    pub fn normalized(
        level_id: Option<String>,
        major_id: Option<String>,
        class_id: Option<String>,
        options: &FilterOptions<'_>,
    ) -> Self {
        let mut sel = FilterSelection::default();
        sel.set_level(level_id, options);
        if major_id.is_some() {
            sel.set_major(major_id, options);
        }
        if class_id.is_some() {
            sel.set_class(class_id, options);
        }
        sel
    }

    pub fn to_filter(&self) -> RankingFilter {
        RankingFilter {
            class_id: self.class_id.clone(),
            major_id: self.major_id.clone(),
            level_id: self.level_id.clone(),
            semester: None,
            subject_id: None,
        }
    }

    fn revalidate_major(&mut self, options: &FilterOptions<'_>) {
        if let Some(major) = self.major_id.as_deref() {
            if !options.major_allowed(self.level_id.as_deref(), major) {
                self.major_id = None;
            }
        }
        self.revalidate_class(options);
    }

    fn revalidate_class(&mut self, options: &FilterOptions<'_>) {
        if let Some(class) = self.class_id.as_deref() {
            if !options.class_allowed(self.level_id.as_deref(), self.major_id.as_deref(), class) {
                self.class_id = None;
            }
        }
    }
}
