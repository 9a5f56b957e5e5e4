use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::EngineResult;

/// Config file name at the workspace root
pub const CONFIG_FILE: &str = "inkgate.toml";

// =============================================================================
// Workflow Configuration
// =============================================================================

/// Bounds on the production loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Rewrite rounds a unit may consume before the run halts
    #[serde(default = "default_max_rewrite_rounds")]
    pub max_rewrite_rounds: u32,
    /// Agent review rounds before materials are forced to the human gate
    #[serde(default = "default_max_materials_review_rounds")]
    pub max_materials_review_rounds: u32,
    /// Change proposals a single run may open
    #[serde(default = "default_proposal_budget")]
    pub proposal_budget: u32,
}

fn default_max_rewrite_rounds() -> u32 {
    2
}

fn default_max_materials_review_rounds() -> u32 {
    3
}

fn default_proposal_budget() -> u32 {
    3
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_rewrite_rounds: default_max_rewrite_rounds(),
            max_materials_review_rounds: default_max_materials_review_rounds(),
            proposal_budget: default_proposal_budget(),
        }
    }
}

// =============================================================================
// Capability Configuration
// =============================================================================

/// Timeout and retry policy for producer/reviewer invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    12_000
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl CapabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Exponential backoff for the given 1-based attempt, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// =============================================================================
// Audit / Run Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// String fields longer than this are externalized to the payload area
    #[serde(default = "default_inline_limit")]
    pub inline_limit: usize,
}

fn default_inline_limit() -> usize {
    512
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            inline_limit: default_inline_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Units to produce in one run
    #[serde(default = "default_chapters")]
    pub chapters: u32,
    /// A lock whose heartbeat is older than this belongs to a dead run
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Consent to archive the run into stages/ when it ends
    #[serde(default)]
    pub auto_archive: bool,
    #[serde(default = "default_stage")]
    pub stage: String,
}

fn default_chapters() -> u32 {
    1
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_stage() -> String {
    "stage1".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chapters: default_chapters(),
            stale_after_secs: default_stale_after_secs(),
            auto_archive: false,
            stage: default_stage(),
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Engine configuration, loaded from `inkgate.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub run: RunConfig,
    /// External command per role name (e.g. `writer = ["my-writer", "--json"]`)
    #[serde(default)]
    pub producer: BTreeMap<String, Vec<String>>,
}

impl EngineConfig {
    /// Load config from `<workspace>/inkgate.toml`, falling back to defaults
    pub fn load(workspace_root: &Path) -> EngineResult<Self> {
        let config_path = workspace_root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to `<workspace>/inkgate.toml`
    pub fn save(&self, workspace_root: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(workspace_root)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(workspace_root.join(CONFIG_FILE), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::load(temp.path()).unwrap();
        assert_eq!(config.workflow.max_rewrite_rounds, 2);
        assert_eq!(config.capability.max_attempts, 3);
        assert!(!config.run.auto_archive);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE),
            "[workflow]\nmax_rewrite_rounds = 5\n\n[producer]\nwriter = [\"my-writer\", \"--json\"]\n",
        )
        .unwrap();

        let config = EngineConfig::load(temp.path()).unwrap();
        assert_eq!(config.workflow.max_rewrite_rounds, 5);
        assert_eq!(config.workflow.proposal_budget, 3);
        assert_eq!(config.producer["writer"], vec!["my-writer", "--json"]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = CapabilityConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(10), Duration::from_millis(12_000));
    }
}
