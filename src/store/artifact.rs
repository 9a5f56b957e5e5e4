//! Versioned, append-only artifact storage
//!
//! A slot `(family, version)` is written once. Re-writing identical bytes is
//! a no-op, anything else is a [`EngineError::VersionConflict`]. The only
//! mutable file per family is its version pointer, replaced atomically.

use crate::context::ProjectId;
use crate::error::{EngineError, EngineResult};
use crate::models::unit::{parse_unit_id, unit_id};
use crate::store::layout::{atomic_write, checksum, to_json_bytes, write_new, ProjectPaths};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// Artifact family; each has its own version sequence and pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    MaterialsDraft,
    MaterialsFrozen,
    MaterialsReview,
    MaterialsDigest,
    AnchorSnapshot,
    Canon,
    UnitText(u32),
    UnitReview(u32),
    UnitDecision(u32),
    Memory,
}

impl Family {
    /// Stable key used in events and errors (`unit_text/unit-003`)
    pub fn key(&self) -> String {
        match self {
            Family::MaterialsDraft => "materials_draft".to_string(),
            Family::MaterialsFrozen => "materials_frozen".to_string(),
            Family::MaterialsReview => "materials_review".to_string(),
            Family::MaterialsDigest => "materials_digest".to_string(),
            Family::AnchorSnapshot => "anchor_snapshot".to_string(),
            Family::Canon => "canon".to_string(),
            Family::UnitText(c) => format!("unit_text/{}", unit_id(*c)),
            Family::UnitReview(c) => format!("unit_review/{}", unit_id(*c)),
            Family::UnitDecision(c) => format!("unit_decision/{}", unit_id(*c)),
            Family::Memory => "memory".to_string(),
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let simple = match key {
            "materials_draft" => Some(Family::MaterialsDraft),
            "materials_frozen" => Some(Family::MaterialsFrozen),
            "materials_review" => Some(Family::MaterialsReview),
            "materials_digest" => Some(Family::MaterialsDigest),
            "anchor_snapshot" => Some(Family::AnchorSnapshot),
            "canon" => Some(Family::Canon),
            "memory" => Some(Family::Memory),
            _ => None,
        };
        if simple.is_some() {
            return simple;
        }
        let (kind, unit) = key.split_once('/')?;
        let chapter = parse_unit_id(unit)?;
        match kind {
            "unit_text" => Some(Family::UnitText(chapter)),
            "unit_review" => Some(Family::UnitReview(chapter)),
            "unit_decision" => Some(Family::UnitDecision(chapter)),
            _ => None,
        }
    }

    /// Project-relative directory of the family
    fn dir(&self) -> String {
        match self {
            Family::MaterialsDraft => "materials/drafts".to_string(),
            Family::MaterialsFrozen => "materials/frozen".to_string(),
            Family::MaterialsReview => "materials/reviews".to_string(),
            Family::MaterialsDigest => "materials/digests".to_string(),
            Family::AnchorSnapshot => "materials/anchors".to_string(),
            Family::Canon => "canon".to_string(),
            Family::UnitText(c) | Family::UnitReview(c) | Family::UnitDecision(c) => {
                format!("units/{}", unit_id(*c))
            }
            Family::Memory => "memory".to_string(),
        }
    }

    /// File name prefix and extension; the version sits between them
    fn stem(&self) -> (&'static str, &'static str) {
        match self {
            Family::MaterialsDraft => ("materials_pack.v", "json"),
            Family::MaterialsFrozen => ("materials_pack.frozen.v", "json"),
            Family::MaterialsReview => ("review.v", "json"),
            Family::MaterialsDigest => ("dod.v", "json"),
            Family::AnchorSnapshot => ("anchors.v", "json"),
            Family::Canon => ("canon.v", "json"),
            Family::UnitText(_) => ("draft.v", "md"),
            Family::UnitReview(_) => ("review.v", "json"),
            Family::UnitDecision(_) => ("decision.v", "json"),
            Family::Memory => ("unit-", "json"),
        }
    }

    /// Project-relative slot path
    pub fn rel_path(&self, version: u32) -> String {
        let (prefix, ext) = self.stem();
        format!("{}/{}{:03}.{}", self.dir(), prefix, version, ext)
    }

    fn parse_file_name(&self, name: &str) -> Option<u32> {
        let (prefix, ext) = self.stem();
        let digits = name.strip_prefix(prefix)?.strip_suffix(ext)?.strip_suffix('.')?;
        if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Project-relative pointer path
    pub fn pointer_rel_path(&self) -> String {
        match self {
            Family::MaterialsFrozen => "materials/index.json".to_string(),
            Family::MaterialsDraft => "materials/drafts/current.json".to_string(),
            Family::UnitText(_) => format!("{}/draft.current.json", self.dir()),
            Family::UnitReview(_) => format!("{}/review.current.json", self.dir()),
            Family::UnitDecision(_) => format!("{}/decision.current.json", self.dir()),
            _ => format!("{}/current.json", self.dir()),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Family::UnitText(_))
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Reference to a written slot, recorded in committing events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub family: String,
    pub version: u32,
    pub path: String,
    pub hash: String,
}

/// Pointer value recorded in committing events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointerRef {
    pub family: String,
    pub version: u32,
}

/// Result of [`ArtifactStore::write`]
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub artifact: ArtifactRef,
    /// `false` when identical content was already in the slot
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointerFile {
    family: String,
    version: u32,
    updated_at: String,
}

/// `materials/index.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialsIndex {
    pub current_frozen_version: u32,
    pub frozen_path: String,
    pub updated_at: String,
}

/// Proof that the caller may write Canon; only freeze can mint one
pub struct CanonAuthority {
    _private: (),
}

impl CanonAuthority {
    pub(crate) fn grant() -> Self {
        Self { _private: () }
    }
}

// =============================================================================
// Artifact store
// =============================================================================

/// Versioned storage for one project
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    paths: ProjectPaths,
}

impl ArtifactStore {
    pub fn open(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn slot_path(&self, family: Family, version: u32) -> EngineResult<PathBuf> {
        self.paths.join(&family.rel_path(version))
    }

    /// Write a slot. Canon is refused here; see [`ArtifactStore::write_canon`].
    pub fn write(&self, caller: &ProjectId, family: Family, version: u32, bytes: &[u8]) -> EngineResult<WriteOutcome> {
        if family == Family::Canon {
            return Err(EngineError::CanonWriteDenied(format!(
                "direct write of canon v{:03}",
                version
            )));
        }
        self.write_slot(caller, family, version, bytes)
    }

    pub fn write_json(&self, caller: &ProjectId, family: Family, version: u32, value: &Value) -> EngineResult<WriteOutcome> {
        self.write(caller, family, version, &to_json_bytes(value)?)
    }

    pub(crate) fn write_canon(
        &self,
        caller: &ProjectId,
        _authority: &CanonAuthority,
        version: u32,
        canon: &Value,
    ) -> EngineResult<WriteOutcome> {
        self.write_slot(caller, Family::Canon, version, &to_json_bytes(canon)?)
    }

    fn write_slot(&self, caller: &ProjectId, family: Family, version: u32, bytes: &[u8]) -> EngineResult<WriteOutcome> {
        self.paths.guard(caller)?;
        let rel = family.rel_path(version);
        let path = self.paths.join(&rel)?;
        let hash = checksum(bytes);
        let artifact = ArtifactRef {
            family: family.key(),
            version,
            path: rel,
            hash: hash.clone(),
        };

        if write_new(&path, bytes)? {
            tracing::debug!(family = %family, version, "artifact written");
            return Ok(WriteOutcome { artifact, created: true });
        }

        let existing = std::fs::read(&path)?;
        if checksum(&existing) == hash {
            tracing::debug!(family = %family, version, "identical re-write ignored");
            Ok(WriteOutcome { artifact, created: false })
        } else {
            tracing::warn!(family = %family, version, "refusing to overwrite occupied slot");
            Err(EngineError::VersionConflict {
                family: family.key(),
                version,
            })
        }
    }

    pub fn exists(&self, caller: &ProjectId, family: Family, version: u32) -> EngineResult<bool> {
        self.paths.guard(caller)?;
        Ok(self.slot_path(family, version)?.is_file())
    }

    pub fn read(&self, caller: &ProjectId, family: Family, version: u32) -> EngineResult<Vec<u8>> {
        self.paths.guard(caller)?;
        let path = self.slot_path(family, version)?;
        if !path.is_file() {
            return Err(EngineError::NotFound(format!("{} v{:03}", family, version)));
        }
        Ok(std::fs::read(path)?)
    }

    pub fn read_text(&self, caller: &ProjectId, family: Family, version: u32) -> EngineResult<String> {
        let bytes = self.read(caller, family, version)?;
        String::from_utf8(bytes)
            .map_err(|_| EngineError::LogCorruption(format!("{} v{:03} is not UTF-8", family, version)))
    }

    pub fn read_json(&self, caller: &ProjectId, family: Family, version: u32) -> EngineResult<Value> {
        Ok(serde_json::from_slice(&self.read(caller, family, version)?)?)
    }

    /// Versions present on disk, ascending
    pub fn versions(&self, caller: &ProjectId, family: Family) -> EngineResult<Vec<u32>> {
        self.paths.guard(caller)?;
        let dir = self.paths.join(&family.dir())?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out: Vec<u32> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| family.parse_file_name(n)))
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    pub fn latest_version(&self, caller: &ProjectId, family: Family) -> EngineResult<Option<u32>> {
        Ok(self.versions(caller, family)?.last().copied())
    }

    // =========================================================================
    // Pointers
    // =========================================================================

    /// Currently effective version of a family
    pub fn pointer(&self, caller: &ProjectId, family: Family) -> EngineResult<Option<u32>> {
        self.paths.guard(caller)?;
        let path = self.paths.join(&family.pointer_rel_path())?;
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read(&path)?;
        if family == Family::MaterialsFrozen {
            let index: MaterialsIndex = serde_json::from_slice(&content)?;
            return Ok(Some(index.current_frozen_version));
        }
        let pointer: PointerFile = serde_json::from_slice(&content)?;
        Ok(Some(pointer.version))
    }

    /// Point the family at an existing slot
    pub fn advance_pointer(&self, caller: &ProjectId, family: Family, version: u32) -> EngineResult<PointerRef> {
        self.paths.guard(caller)?;
        let slot = self.slot_path(family, version)?;
        if !slot.is_file() {
            return Err(EngineError::NotFound(format!("{} v{:03}", family, version)));
        }
        let path = self.paths.join(&family.pointer_rel_path())?;
        let updated_at = Utc::now().to_rfc3339();
        let bytes = if family == Family::MaterialsFrozen {
            to_json_bytes(&MaterialsIndex {
                current_frozen_version: version,
                frozen_path: family.rel_path(version),
                updated_at,
            })?
        } else {
            to_json_bytes(&PointerFile {
                family: family.key(),
                version,
                updated_at,
            })?
        };
        atomic_write(&path, &bytes)?;
        tracing::debug!(family = %family, version, "pointer advanced");
        Ok(PointerRef {
            family: family.key(),
            version,
        })
    }

    /// Remove a pointer that references nothing committed
    pub(crate) fn clear_pointer(&self, caller: &ProjectId, family: Family) -> EngineResult<()> {
        self.paths.guard(caller)?;
        let path = self.paths.join(&family.pointer_rel_path())?;
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn frozen_version(&self, caller: &ProjectId) -> EngineResult<Option<u32>> {
        self.pointer(caller, Family::MaterialsFrozen)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Every slot on disk, across all families
    pub fn all_slots(&self, caller: &ProjectId) -> EngineResult<Vec<(Family, u32)>> {
        self.paths.guard(caller)?;
        let mut families = vec![
            Family::MaterialsDraft,
            Family::MaterialsFrozen,
            Family::MaterialsReview,
            Family::MaterialsDigest,
            Family::AnchorSnapshot,
            Family::Canon,
            Family::Memory,
        ];
        let units = self.paths.units_dir();
        if units.is_dir() {
            for entry in std::fs::read_dir(units)? {
                let entry = entry?;
                if let Some(chapter) = entry.file_name().to_str().and_then(parse_unit_id) {
                    families.push(Family::UnitText(chapter));
                    families.push(Family::UnitReview(chapter));
                    families.push(Family::UnitDecision(chapter));
                }
            }
        }
        let mut out = Vec::new();
        for family in families {
            for version in self.versions(caller, family)? {
                out.push((family, version));
            }
        }
        Ok(out)
    }

    /// Move an uncommitted slot out of the way, keeping it for inspection
    pub(crate) fn quarantine(&self, caller: &ProjectId, family: Family, version: u32, tag: &str) -> EngineResult<PathBuf> {
        self.paths.guard(caller)?;
        let rel = family.rel_path(version);
        let from = self.paths.join(&rel)?;
        let to = self.paths.quarantine_dir().join(tag).join(&rel);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from, &to)?;
        tracing::warn!(family = %family, version, to = %to.display(), "uncommitted artifact quarantined");
        Ok(to)
    }
}
