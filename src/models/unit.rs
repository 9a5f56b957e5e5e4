use serde::{Deserialize, Serialize};

use super::decision::UnitDecision;

/// Stable unit identifier used as proposal evidence (`unit-003`)
pub fn unit_id(chapter: u32) -> String {
    format!("unit-{:03}", chapter)
}

/// Parse `unit-NNN` back into a chapter number
pub fn parse_unit_id(id: &str) -> Option<u32> {
    let digits = id.strip_prefix("unit-")?;
    if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Verdict of the agent review step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Pass,
    NeedsChanges,
}

/// Issue raised by the reviewer capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewIssue {
    pub id: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub kind: String,
    pub description: String,
    /// Anchors the issue refers to
    #[serde(default)]
    pub anchors: Vec<String>,
}

/// Structured review report produced by the reviewer capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewReport {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

impl ReviewReport {
    /// Guard over reviewer output: parse and check the report is usable
    pub fn from_output(value: &serde_json::Value) -> Result<Self, String> {
        let report: ReviewReport =
            serde_json::from_value(value.clone()).map_err(|e| format!("malformed review report: {}", e))?;
        if report.verdict == ReviewVerdict::NeedsChanges && report.issues.is_empty() {
            return Err("review verdict needs_changes without any issue".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for issue in &report.issues {
            if issue.id.trim().is_empty() {
                return Err("review issue without id".to_string());
            }
            if !seen.insert(issue.id.as_str()) {
                return Err(format!("duplicate review issue id {}", issue.id));
            }
        }
        Ok(report)
    }

    pub fn has_issue(&self, id: &str) -> bool {
        self.issues.iter().any(|i| i.id == id)
    }
}

/// Human review record kept for every decided unit gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanReviewRecord {
    pub chapter: u32,
    pub round: u32,
    pub frozen_version: u32,
    pub decision: UnitDecision,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub references: Vec<String>,
    pub gate_id: String,
    pub decided_at: String,
}

/// Long-term memory written only after an accept decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub chapter: u32,
    pub round: u32,
    pub frozen_version: u32,
    pub summary: String,
    /// Hash of the accepted unit text
    pub text_hash: String,
    pub accepted_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_id_round_trip() {
        assert_eq!(unit_id(3), "unit-003");
        assert_eq!(parse_unit_id("unit-003"), Some(3));
        assert_eq!(parse_unit_id("unit-3"), None);
        assert_eq!(parse_unit_id("chapter-003"), None);
    }

    #[test]
    fn test_review_report_guard() {
        let ok = json!({"verdict": "pass", "summary": "fine"});
        assert!(ReviewReport::from_output(&ok).is_ok());

        let missing_issues = json!({"verdict": "needs_changes"});
        assert!(ReviewReport::from_output(&missing_issues).is_err());

        let bad_verdict = json!({"verdict": "maybe"});
        assert!(ReviewReport::from_output(&bad_verdict).is_err());

        let dup = json!({"verdict": "needs_changes", "issues": [
            {"id": "ISS-1", "description": "a"},
            {"id": "ISS-1", "description": "b"}
        ]});
        assert!(ReviewReport::from_output(&dup).is_err());
    }
}
