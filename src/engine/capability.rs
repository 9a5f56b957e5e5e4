//! Producer and reviewer capabilities
//!
//! The engine never talks to a model directly. Each role is served by a
//! [`Capability`] that takes a structured request and returns structured
//! content; the engine validates that content with a guard before anything
//! is written.

use crate::models::CapabilityConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    MaterialsAuthor,
    MaterialsReviewer,
    Writer,
    Editor,
    Advisor,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::MaterialsAuthor,
        Role::MaterialsReviewer,
        Role::Writer,
        Role::Editor,
        Role::Advisor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::MaterialsAuthor => "materials_author",
            Role::MaterialsReviewer => "materials_reviewer",
            Role::Writer => "writer",
            Role::Editor => "editor",
            Role::Advisor => "advisor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task names carried in [`CapabilityRequest::task`]
pub mod task {
    pub const DRAFT_MATERIALS: &str = "draft_materials";
    pub const REVIEW_MATERIALS: &str = "review_materials";
    pub const REVISE_MATERIALS: &str = "revise_materials";
    pub const WRITE_UNIT: &str = "write_unit";
    pub const REVIEW_UNIT: &str = "review_unit";
    pub const REWRITE_UNIT: &str = "rewrite_unit";
    pub const DRAFT_PROPOSAL: &str = "draft_proposal";
    pub const REVIEW_PROPOSAL: &str = "review_proposal";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub role: Role,
    pub task: String,
    pub project: String,
    pub run_id: String,
    pub chapter: u32,
    pub round: u32,
    /// 1-based attempt number of this call
    pub attempt: u32,
    pub instructions: String,
    pub context: Value,
    pub timeout_secs: u64,
}

impl CapabilityRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityOutput {
    pub content: Value,
    /// Output was cut short by the producer
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl CapabilityOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            truncated: false,
            model: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CapabilityError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl CapabilityError {
    /// Transient, malformed and timed-out calls are retried within budget
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CapabilityError::Fatal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::Transient(_) => "transient",
            CapabilityError::Malformed(_) => "malformed",
            CapabilityError::Timeout(_) => "timeout",
            CapabilityError::Fatal(_) => "fatal",
        }
    }
}

pub trait Capability {
    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError>;
}

impl<T: Capability + ?Sized> Capability for Box<T> {
    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        (**self).generate(request)
    }
}

/// Exponential backoff for `attempt` plus up to 25% random jitter
pub fn backoff_with_jitter(config: &CapabilityConfig, attempt: u32) -> Duration {
    let base = config.backoff(attempt);
    let ms = base.as_millis() as u64;
    if ms == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=ms / 4);
    Duration::from_millis(ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CapabilityError::Transient("503".to_string()).is_retryable());
        assert!(CapabilityError::Malformed("not json".to_string()).is_retryable());
        assert!(CapabilityError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CapabilityError::Fatal("no such command".to_string()).is_retryable());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = CapabilityConfig::default();
        for _ in 0..50 {
            let d = backoff_with_jitter(&config, 2);
            assert!(d >= Duration::from_millis(2000) && d <= Duration::from_millis(2500));
        }
        let zero = CapabilityConfig {
            base_backoff_ms: 0,
            ..CapabilityConfig::default()
        };
        assert_eq!(backoff_with_jitter(&zero, 3), Duration::ZERO);
    }

    #[test]
    fn test_role_names() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(serde_json::to_string(&Role::MaterialsAuthor).unwrap(), "\"materials_author\"");
    }
}
