//! Materials Definition-of-Done
//!
//! Structural checks over a materials pack. Blocker and major issues make up
//! the `all_required_fields_present` freeze predicate; minor and warn issues
//! are reported but never block.

use crate::error::FailedPredicate;
use crate::models::materials::{conflicts, get_path, open_questions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PREDICATE_BLOCKERS: &str = "blocker_open_questions == 0";
pub const PREDICATE_REQUIRED: &str = "all_required_fields_present";
pub const PREDICATE_CONFLICTS: &str = "no_unresolved_conflicts";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocker,
    Major,
    Minor,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DodIssue {
    pub id: String,
    pub severity: Severity,
    pub path: String,
    pub message: String,
    #[serde(default)]
    pub hint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DodReport {
    pub issues: Vec<DodIssue>,
}

impl DodReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// No blocker or major issue
    pub fn passed(&self) -> bool {
        self.count(Severity::Blocker) == 0 && self.count(Severity::Major) == 0
    }

    /// `DoD=PASS blocker=0 major=0 minor=1 warn=2`
    pub fn summary_line(&self) -> String {
        format!(
            "DoD={} blocker={} major={} minor={} warn={}",
            if self.passed() { "PASS" } else { "FAIL" },
            self.count(Severity::Blocker),
            self.count(Severity::Major),
            self.count(Severity::Minor),
            self.count(Severity::Warn)
        )
    }

    fn push(&mut self, severity: Severity, path: &str, message: &str, hint: &str) {
        self.issues.push(DodIssue {
            id: String::new(),
            severity,
            path: path.to_string(),
            message: message.to_string(),
            hint: hint.to_string(),
        });
    }
}

fn require_object(report: &mut DodReport, pack: &Value, path: &str, severity: Severity) {
    if !get_path(pack, path).is_some_and(Value::is_object) {
        report.push(severity, path, "missing or not an object", "add the section to the draft");
    }
}

fn require_array(report: &mut DodReport, pack: &Value, path: &str, severity: Severity, non_empty: bool) {
    match get_path(pack, path).and_then(Value::as_array) {
        None => report.push(severity, path, "missing or not a list", "add the list to the draft"),
        Some(items) if non_empty && items.is_empty() => {
            report.push(severity, path, "must not be empty", "add at least one entry")
        }
        Some(_) => {}
    }
}

/// Structural DoD report for a pack
pub fn evaluate(pack: &Value) -> DodReport {
    let mut report = DodReport::default();

    require_object(&mut report, pack, "meta", Severity::Major);
    for path in ["canon.world", "canon.characters", "canon.timeline"] {
        require_object(&mut report, pack, path, Severity::Blocker);
    }
    require_array(&mut report, pack, "planning.outline.chapters", Severity::Blocker, true);
    if get_path(pack, "planning.tone").map_or(true, Value::is_null) {
        report.push(Severity::Major, "planning.tone", "missing", "describe the intended tone");
    }
    require_array(&mut report, pack, "execution.decisions", Severity::Major, false);
    require_object(&mut report, pack, "execution.checklists", Severity::Major);
    require_object(&mut report, pack, "execution.glossary", Severity::Minor);
    match get_path(pack, "execution.constraints").and_then(Value::as_object) {
        None => report.push(
            Severity::Major,
            "execution.constraints",
            "missing or not an object",
            "add hard constraints",
        ),
        Some(c) if c.is_empty() => report.push(
            Severity::Major,
            "execution.constraints",
            "must not be empty",
            "add at least one hard constraint",
        ),
        Some(_) => {}
    }
    require_array(&mut report, pack, "risk.open_questions", Severity::Major, false);

    if get_path(pack, "execution.glossary")
        .and_then(Value::as_object)
        .is_some_and(|g| g.values().all(|v| v.as_array().map_or(true, |a| a.is_empty())))
    {
        report.push(Severity::Warn, "execution.glossary", "glossary has no terms", "");
    }

    for (reference, q) in open_questions(pack) {
        if q.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            report.push(Severity::Warn, &reference, "open question without id", "give it a stable id");
        }
        if !q.is_open_blocker() && !q.resolved && q.default_assumption.is_none() {
            report.push(
                Severity::Minor,
                &reference,
                "non-blocking question without default assumption",
                "state the assumption used until answered",
            );
        }
    }

    report.issues.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.path.cmp(&b.path)));
    for (i, issue) in report.issues.iter_mut().enumerate() {
        issue.id = format!("DOD-{:03}", i + 1);
    }
    report
}

/// Evaluate the three freeze predicates; an empty list means freeze may go ahead
pub fn freeze_predicates(pack: &Value) -> (DodReport, Vec<FailedPredicate>) {
    let report = evaluate(pack);
    let mut failed = Vec::new();

    let blockers: Vec<String> = open_questions(pack)
        .into_iter()
        .filter(|(_, q)| q.is_open_blocker())
        .map(|(r, _)| r)
        .collect();
    if !blockers.is_empty() {
        failed.push(FailedPredicate {
            predicate: PREDICATE_BLOCKERS.to_string(),
            details: blockers,
        });
    }

    let missing: Vec<String> = report
        .issues
        .iter()
        .filter(|i| matches!(i.severity, Severity::Blocker | Severity::Major))
        .map(|i| format!("{}: {}", i.path, i.message))
        .collect();
    if !missing.is_empty() {
        failed.push(FailedPredicate {
            predicate: PREDICATE_REQUIRED.to_string(),
            details: missing,
        });
    }

    let open_conflicts: Vec<String> = conflicts(pack)
        .into_iter()
        .filter(|(_, c)| !c.resolved)
        .map(|(r, _)| r)
        .collect();
    if !open_conflicts.is_empty() {
        failed.push(FailedPredicate {
            predicate: PREDICATE_CONFLICTS.to_string(),
            details: open_conflicts,
        });
    }

    (report, failed)
}
