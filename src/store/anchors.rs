//! Anchor registry
//!
//! Anchors are allocated from per-kind counters that only grow. Each anchor
//! remembers the logical entity it was allocated for and the JSON path it is
//! bound to at every frozen version.
//!
//! Allocation and binding change the in-memory registry only. The registry
//! reaches disk through [`AnchorIndex::save`] once the frozen pointer it
//! describes has moved, and [`AnchorIndex::rollback_to`] drops anything bound
//! past the committed frozen version.

use crate::context::ProjectId;
use crate::error::{EngineError, EngineResult};
use crate::models::materials::get_path;
use crate::models::{AnchorId, AnchorKind};
use crate::store::layout::{atomic_write, to_json_bytes, ProjectPaths};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

const REGISTRY_FILE: &str = "materials/anchors/registry.json";

/// Field written into every anchored pack entry
pub const ANCHOR_FIELD: &str = "anchor";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorEntry {
    pub entity: String,
    pub allocated_at: u32,
    /// Frozen version -> JSON path
    #[serde(default)]
    pub bindings: BTreeMap<u32, String>,
    /// First version at which the entity no longer exists
    #[serde(default)]
    pub retired_at: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    /// Kind prefix -> last sequence number handed out
    #[serde(default)]
    counters: BTreeMap<String, u32>,
    /// Entity key -> anchor id
    #[serde(default)]
    entities: BTreeMap<String, String>,
    #[serde(default)]
    anchors: BTreeMap<String, AnchorEntry>,
}

/// Anchor binding produced for one frozen version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorBinding {
    pub id: AnchorId,
    pub path: String,
}

/// Stable id allocation and resolution for one project
#[derive(Debug)]
pub struct AnchorIndex {
    paths: ProjectPaths,
    registry: Registry,
}

impl AnchorIndex {
    pub fn load(paths: ProjectPaths) -> EngineResult<Self> {
        let registry = read_registry(&paths)?;
        Ok(Self { paths, registry })
    }

    /// Discard unsaved changes
    pub fn reload(&mut self) -> EngineResult<()> {
        self.registry = read_registry(&self.paths)?;
        Ok(())
    }

    /// Forget bindings and retirements past the committed frozen version and
    /// persist the result. Counters are kept so no id is handed out twice.
    /// Returns how many bindings were dropped.
    pub fn rollback_to(&mut self, caller: &ProjectId, frozen: Option<u32>) -> EngineResult<usize> {
        self.paths.guard(caller)?;
        let limit = frozen.unwrap_or(0);
        let mut dropped = 0;
        let mut changed = false;
        for entry in self.registry.anchors.values_mut() {
            let before = entry.bindings.len();
            entry.bindings.retain(|version, _| *version <= limit);
            dropped += before - entry.bindings.len();
            if entry.retired_at.is_some_and(|r| r > limit) {
                entry.retired_at = None;
                changed = true;
            }
        }
        if dropped > 0 || changed {
            self.save(caller)?;
            tracing::warn!(frozen = ?frozen, dropped, "anchor bindings rolled back");
        }
        Ok(dropped)
    }

    fn file(&self) -> EngineResult<PathBuf> {
        self.paths.join(REGISTRY_FILE)
    }

    pub fn save(&self, caller: &ProjectId) -> EngineResult<()> {
        self.paths.guard(caller)?;
        atomic_write(&self.file()?, &to_json_bytes(&self.registry)?)
    }

    /// Next unused id of a kind; never handed out again
    pub fn allocate(&mut self, caller: &ProjectId, kind: AnchorKind, version: u32) -> EngineResult<AnchorId> {
        self.paths.guard(caller)?;
        let counter = self.registry.counters.entry(kind.prefix().to_string()).or_insert(0);
        *counter += 1;
        let id = AnchorId::new(kind, *counter);
        self.registry.anchors.insert(
            id.to_string(),
            AnchorEntry {
                entity: format!("{}#{}", kind.prefix(), *counter),
                allocated_at: version,
                bindings: BTreeMap::new(),
                retired_at: None,
            },
        );
        Ok(id)
    }

    /// Id for a logical entity: existing one when the key is known
    pub fn allocate_for(&mut self, caller: &ProjectId, kind: AnchorKind, entity: &str, version: u32) -> EngineResult<AnchorId> {
        self.paths.guard(caller)?;
        let key = format!("{}:{}", kind.prefix(), entity);
        if let Some(existing) = self.registry.entities.get(&key) {
            return existing.parse();
        }
        let id = self.allocate(caller, kind, version)?;
        if let Some(entry) = self.registry.anchors.get_mut(&id.to_string()) {
            entry.entity = key.clone();
        }
        self.registry.entities.insert(key, id.to_string());
        Ok(id)
    }

    /// Whether the id was ever allocated
    pub fn contains(&self, id: &AnchorId) -> bool {
        self.registry.anchors.contains_key(&id.to_string())
    }

    pub fn entry(&self, id: &AnchorId) -> Option<&AnchorEntry> {
        self.registry.anchors.get(&id.to_string())
    }

    pub fn bind(&mut self, caller: &ProjectId, id: &AnchorId, version: u32, path: &str) -> EngineResult<()> {
        self.paths.guard(caller)?;
        let entry = self.registry.anchors.get_mut(&id.to_string()).ok_or_else(|| EngineError::AnchorNotFound {
            anchor: id.to_string(),
            version,
        })?;
        entry.bindings.insert(version, path.to_string());
        if entry.retired_at.is_some_and(|r| r <= version) {
            entry.retired_at = None;
        }
        Ok(())
    }

    /// Path of an anchor at a version: the binding at that version, else the
    /// latest binding before it, unless the entity was retired in between.
    pub fn resolve(&self, caller: &ProjectId, id: &AnchorId, version: u32) -> EngineResult<String> {
        self.paths.guard(caller)?;
        let not_found = || EngineError::AnchorNotFound {
            anchor: id.to_string(),
            version,
        };
        let entry = self.registry.anchors.get(&id.to_string()).ok_or_else(not_found)?;
        let (bound_at, path) = entry.bindings.range(..=version).next_back().ok_or_else(not_found)?;
        if entry.retired_at.is_some_and(|r| r > *bound_at && r <= version) {
            return Err(not_found());
        }
        Ok(path.clone())
    }

    /// Bindings at exactly one version
    pub fn bindings_at(&self, version: u32) -> Vec<AnchorBinding> {
        self.registry
            .anchors
            .iter()
            .filter_map(|(id, entry)| {
                let path = entry.bindings.get(&version)?;
                Some(AnchorBinding {
                    id: id.parse().ok()?,
                    path: path.clone(),
                })
            })
            .collect()
    }

    // =========================================================================
    // Pack assignment
    // =========================================================================

    /// Give every referable entry of `pack` an anchor and bind it at `version`.
    ///
    /// Entries that already carry a known anchor keep it, so ids survive
    /// migrations that move entries around. Anchors seen at the previous
    /// version but missing now are retired.
    pub fn assign(&mut self, caller: &ProjectId, pack: &mut Value, version: u32) -> EngineResult<Vec<AnchorBinding>> {
        self.paths.guard(caller)?;
        let mut used: BTreeSet<AnchorId> = BTreeSet::new();
        let mut bindings = Vec::new();

        for site in anchor_sites(pack) {
            let Some(entry) = pointer_mut(pack, &site.pointer) else {
                continue;
            };
            let carried = entry
                .get(ANCHOR_FIELD)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<AnchorId>().ok())
                .filter(|id| id.kind == site.kind && self.contains(id) && !used.contains(id));

            let id = match carried {
                Some(id) => id,
                None => {
                    let mut id = self.allocate_for(caller, site.kind, &site.entity, version)?;
                    if used.contains(&id) {
                        // two entries share a natural key; fall back to the path
                        id = self.allocate_for(caller, site.kind, &format!("@{}", site.path), version)?;
                    }
                    id
                }
            };
            used.insert(id);
            if let Some(obj) = entry.as_object_mut() {
                obj.insert(ANCHOR_FIELD.to_string(), Value::String(id.to_string()));
            }
            self.bind(caller, &id, version, &site.path)?;
            bindings.push(AnchorBinding { id, path: site.path });
        }

        for (id, entry) in self.registry.anchors.iter_mut() {
            let seen = id.parse::<AnchorId>().map(|a| used.contains(&a)).unwrap_or(false);
            let was_bound = entry.bindings.range(..version).next_back().is_some();
            if !seen && was_bound && entry.retired_at.is_none() {
                entry.retired_at = Some(version);
            }
        }

        tracing::info!(version, anchors = bindings.len(), "anchors assigned");
        Ok(bindings)
    }
}

fn read_registry(paths: &ProjectPaths) -> EngineResult<Registry> {
    let file = paths.join(REGISTRY_FILE)?;
    if !file.is_file() {
        return Ok(Registry::default());
    }
    Ok(serde_json::from_slice(&std::fs::read(&file)?)?)
}

struct AnchorSite {
    kind: AnchorKind,
    /// Display path (`execution.decisions[0]`)
    path: String,
    /// Key path used to reach the entry
    pointer: Vec<PathStep>,
    /// Natural key of the logical entity
    entity: String,
}

#[derive(Clone)]
enum PathStep {
    Key(String),
    Index(usize),
}

fn pointer_mut<'a>(value: &'a mut Value, steps: &[PathStep]) -> Option<&'a mut Value> {
    steps.iter().try_fold(value, |cur, step| match step {
        PathStep::Key(k) => cur.as_object_mut()?.get_mut(k),
        PathStep::Index(i) => cur.as_array_mut()?.get_mut(*i),
    })
}

fn natural_key(entry: &Value, fallback: &str) -> String {
    for field in ["id", "name", "term", "title"] {
        if let Some(s) = entry.get(field).and_then(Value::as_str) {
            if !s.trim().is_empty() {
                return s.trim().to_lowercase();
            }
        }
    }
    format!("@{}", fallback)
}

fn split_path(path: &str) -> Vec<PathStep> {
    path.split('.').map(|p| PathStep::Key(p.to_string())).collect()
}

/// Entries that receive anchors, in a deterministic order
fn anchor_sites(pack: &Value) -> Vec<AnchorSite> {
    let mut sites = Vec::new();
    let list_sites = [
        (AnchorKind::Decision, "execution.decisions"),
        (AnchorKind::WorldRule, "canon.world.rules"),
        (AnchorKind::Character, "canon.characters.characters"),
        (AnchorKind::Timeline, "canon.timeline.events"),
        (AnchorKind::OpenQuestion, "risk.open_questions"),
    ];
    for (kind, base) in list_sites {
        let Some(items) = get_path(pack, base).and_then(Value::as_array) else {
            continue;
        };
        for (i, item) in items.iter().enumerate() {
            if !item.is_object() {
                continue;
            }
            let path = format!("{}[{}]", base, i);
            let mut pointer = split_path(base);
            pointer.push(PathStep::Index(i));
            sites.push(AnchorSite {
                kind,
                entity: natural_key(item, &path),
                path,
                pointer,
            });
        }
    }

    if let Some(glossary) = get_path(pack, "execution.glossary").and_then(Value::as_object) {
        for (category, items) in glossary {
            let Some(items) = items.as_array() else {
                continue;
            };
            for (i, item) in items.iter().enumerate() {
                if !item.is_object() {
                    continue;
                }
                let path = format!("execution.glossary.{}[{}]", category, i);
                let mut pointer = split_path("execution.glossary");
                pointer.push(PathStep::Key(category.clone()));
                pointer.push(PathStep::Index(i));
                sites.push(AnchorSite {
                    kind: AnchorKind::Glossary,
                    entity: format!("{}/{}", category, natural_key(item, &path)),
                    path,
                    pointer,
                });
            }
        }
    }

    if let Some(checklists) = get_path(pack, "execution.checklists").and_then(Value::as_object) {
        for (name, list) in checklists {
            if !list.is_object() {
                continue;
            }
            let path = format!("execution.checklists.{}", name);
            sites.push(AnchorSite {
                kind: AnchorKind::Checklist,
                entity: name.to_lowercase(),
                pointer: split_path(&path),
                path,
            });
        }
    }

    if let Some(constraints) = get_path(pack, "execution.constraints").and_then(Value::as_object) {
        for (name, item) in constraints {
            if !item.is_object() {
                continue;
            }
            let path = format!("execution.constraints.{}", name);
            sites.push(AnchorSite {
                kind: AnchorKind::Constraint,
                entity: name.to_lowercase(),
                pointer: split_path(&path),
                path,
            });
        }
    }

    sites
}
