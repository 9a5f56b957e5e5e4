use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of referable entity inside a materials pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnchorKind {
    Decision,
    Constraint,
    Glossary,
    Checklist,
    WorldRule,
    Character,
    Timeline,
    OpenQuestion,
}

impl AnchorKind {
    pub const ALL: [AnchorKind; 8] = [
        AnchorKind::Decision,
        AnchorKind::Constraint,
        AnchorKind::Glossary,
        AnchorKind::Checklist,
        AnchorKind::WorldRule,
        AnchorKind::Character,
        AnchorKind::Timeline,
        AnchorKind::OpenQuestion,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            AnchorKind::Decision => "DEC",
            AnchorKind::Constraint => "CON",
            AnchorKind::Glossary => "GLO",
            AnchorKind::Checklist => "CHK",
            AnchorKind::WorldRule => "WR",
            AnchorKind::Character => "CHAR",
            AnchorKind::Timeline => "TL",
            AnchorKind::OpenQuestion => "OQ",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

impl fmt::Display for AnchorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Stable anchor identifier, rendered as `KIND-NNN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AnchorId {
    pub kind: AnchorKind,
    pub seq: u32,
}

impl AnchorId {
    pub fn new(kind: AnchorKind, seq: u32) -> Self {
        Self { kind, seq }
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.kind.prefix(), self.seq)
    }
}

impl FromStr for AnchorId {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        let invalid = || EngineError::InvalidId(format!("anchor id '{}' must look like KIND-NNN", s));
        let (prefix, digits) = s.trim().split_once('-').ok_or_else(invalid)?;
        let kind = AnchorKind::from_prefix(prefix).ok_or_else(invalid)?;
        if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let seq = digits.parse().map_err(|_| invalid())?;
        Ok(Self { kind, seq })
    }
}

impl TryFrom<String> for AnchorId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnchorId> for String {
    fn from(id: AnchorId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_id_format_and_parse() {
        let id = AnchorId::new(AnchorKind::Character, 7);
        assert_eq!(id.to_string(), "CHAR-007");
        assert_eq!("CHAR-007".parse::<AnchorId>().unwrap(), id);
        assert_eq!("DEC-1234".parse::<AnchorId>().unwrap().seq, 1234);
    }

    #[test]
    fn test_anchor_id_rejects_malformed() {
        assert!("CHAR-7".parse::<AnchorId>().is_err());
        assert!("XYZ-001".parse::<AnchorId>().is_err());
        assert!("DEC001".parse::<AnchorId>().is_err());
        assert!("DEC-00a".parse::<AnchorId>().is_err());
    }
}
