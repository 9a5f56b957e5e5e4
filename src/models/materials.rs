//! Materials pack views
//!
//! The pack itself is stored as opaque JSON produced by a capability. These
//! types are typed views over the parts the engine reasons about: open
//! questions, conflicts and the changelog.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The four required layers of a materials pack
pub const PACK_LAYERS: [&str; 4] = ["canon", "planning", "execution", "risk"];

/// Follow a dotted path (`risk.open_questions`) through nested objects
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(value, |cur, part| cur.as_object()?.get(part))
}

/// Mutable variant of [`get_path`]
pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(value, |cur, part| cur.as_object_mut()?.get_mut(part))
}

/// Open question recorded in the risk layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenQuestion {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub question: String,
    /// blocker | major | minor
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub blocking: Option<bool>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub default_assumption: Option<String>,
}

impl OpenQuestion {
    /// Unresolved and either `severity == blocker` or `blocking == true`
    pub fn is_open_blocker(&self) -> bool {
        let blocker = self.severity.trim().eq_ignore_ascii_case("blocker") || self.blocking == Some(true);
        blocker && !self.resolved
    }
}

/// Conflict found between materials entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resolved: bool,
}

/// Changelog entry appended on every refreeze
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub version: u32,
    pub base_version: u32,
    pub proposal_id: String,
    pub summary: String,
    pub applied_at: String,
}

/// Open questions with a display reference (id, or path when missing).
///
/// Reads `risk.open_questions` and the older `execution.open_questions`.
pub fn open_questions(pack: &Value) -> Vec<(String, OpenQuestion)> {
    let mut out = Vec::new();
    for path in ["risk.open_questions", "execution.open_questions"] {
        let Some(items) = get_path(pack, path).and_then(Value::as_array) else {
            continue;
        };
        for (i, item) in items.iter().enumerate() {
            if let Ok(q) = serde_json::from_value::<OpenQuestion>(item.clone()) {
                let reference = q
                    .id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("{}[{}]", path, i));
                out.push((reference, q));
            }
        }
    }
    out
}

/// Conflicts from `risk.conflicts` with a display reference
pub fn conflicts(pack: &Value) -> Vec<(String, Conflict)> {
    let Some(items) = get_path(pack, "risk.conflicts").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let c = serde_json::from_value::<Conflict>(item.clone()).ok()?;
            let reference = c
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("risk.conflicts[{}]", i));
            Some((reference, c))
        })
        .collect()
}

/// Mark questions answered by the human as resolved. Returns how many matched.
pub fn apply_answers(pack: &mut Value, answers: &BTreeMap<String, String>) -> usize {
    let mut applied = 0;
    for path in ["risk.open_questions", "execution.open_questions"] {
        let Some(items) = get_path_mut(pack, path).and_then(Value::as_array_mut) else {
            continue;
        };
        for (i, item) in items.iter_mut().enumerate() {
            let Some(obj) = item.as_object_mut() else {
                continue;
            };
            let id = obj
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}[{}]", path, i));
            if let Some(answer) = answers.get(&id) {
                obj.insert("resolved".to_string(), Value::Bool(true));
                obj.insert("answer".to_string(), Value::String(answer.clone()));
                applied += 1;
            }
        }
    }
    applied
}

/// Changelog entries of a pack
pub fn changelog(pack: &Value) -> Vec<ChangelogEntry> {
    pack.get("changelog")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Append a changelog entry unless one for the same proposal already exists.
/// Returns `true` when the entry was added.
pub fn push_changelog(pack: &mut Value, entry: &ChangelogEntry) -> bool {
    if changelog(pack).iter().any(|e| e.proposal_id == entry.proposal_id) {
        return false;
    }
    let Some(obj) = pack.as_object_mut() else {
        return false;
    };
    let log = obj
        .entry("changelog")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !log.is_array() {
        *log = Value::Array(Vec::new());
    }
    if let Some(arr) = log.as_array_mut() {
        if let Ok(v) = serde_json::to_value(entry) {
            arr.push(v);
            return true;
        }
    }
    false
}

/// Set `meta.<key>` on a pack, creating `meta` when missing
pub fn set_meta(pack: &mut Value, key: &str, value: Value) {
    if let Some(obj) = pack.as_object_mut() {
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if !meta.is_object() {
            *meta = Value::Object(Default::default());
        }
        if let Some(meta) = meta.as_object_mut() {
            meta.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_blockers_respect_resolved_flag() {
        let pack = json!({
            "risk": {"open_questions": [
                {"id": "OQ-001", "severity": "blocker", "resolved": false},
                {"id": "OQ-002", "severity": "blocker", "resolved": true},
                {"severity": "minor", "blocking": true},
                {"id": "OQ-004", "severity": "minor"}
            ]}
        });
        let blockers: Vec<String> = open_questions(&pack)
            .into_iter()
            .filter(|(_, q)| q.is_open_blocker())
            .map(|(r, _)| r)
            .collect();
        assert_eq!(blockers, vec!["OQ-001", "risk.open_questions[2]"]);
    }

    #[test]
    fn test_apply_answers_resolves_questions() {
        let mut pack = json!({
            "risk": {"open_questions": [{"id": "OQ-001", "severity": "blocker"}]}
        });
        let mut answers = BTreeMap::new();
        answers.insert("OQ-001".to_string(), "Magic is rare".to_string());
        assert_eq!(apply_answers(&mut pack, &answers), 1);
        let (_, q) = &open_questions(&pack)[0];
        assert!(q.resolved);
        assert_eq!(q.answer.as_deref(), Some("Magic is rare"));
    }

    #[test]
    fn test_push_changelog_once_per_proposal() {
        let mut pack = json!({"meta": {}});
        let entry = ChangelogEntry {
            version: 2,
            base_version: 1,
            proposal_id: "CP-20260101-0001".to_string(),
            summary: "rename faction".to_string(),
            applied_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(push_changelog(&mut pack, &entry));
        assert!(!push_changelog(&mut pack, &entry));
        assert_eq!(changelog(&pack).len(), 1);
    }
}
