//! Content-addressed payload area of a run (`runs/<run>/payloads/`)

use super::event::PayloadRef;
use crate::error::{EngineError, EngineResult};
use crate::store::layout::{checksum, validate_segment, write_new};
use std::path::Path;

/// Write `content` once under its hash and return a reference to it
pub fn store_payload(run_dir: &Path, content: &str) -> EngineResult<PayloadRef> {
    let bytes = content.as_bytes();
    let hash = checksum(bytes);
    let hex = hash.trim_start_matches("sha256:");
    let rel = format!("payloads/{}.txt", hex);
    write_new(&run_dir.join(&rel), bytes)?;
    Ok(PayloadRef {
        path: rel,
        bytes: bytes.len() as u64,
        sha256: Some(hash),
    })
}

fn resolve(run_dir: &Path, payload: &PayloadRef) -> EngineResult<std::path::PathBuf> {
    let (dir, name) = payload
        .path
        .split_once('/')
        .ok_or_else(|| EngineError::LogCorruption(format!("bad payload path {}", payload.path)))?;
    if dir != "payloads" {
        return Err(EngineError::LogCorruption(format!("bad payload path {}", payload.path)));
    }
    validate_segment(name)?;
    Ok(run_dir.join(dir).join(name))
}

pub fn load_payload(run_dir: &Path, payload: &PayloadRef) -> EngineResult<String> {
    let path = resolve(run_dir, payload)?;
    if !path.is_file() {
        return Err(EngineError::NotFound(format!("payload {}", payload.path)));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Size and hash (when recorded) still match
pub fn verify_payload(run_dir: &Path, payload: &PayloadRef) -> EngineResult<bool> {
    let path = resolve(run_dir, payload)?;
    if !path.is_file() {
        return Ok(false);
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() as u64 != payload.bytes {
        return Ok(false);
    }
    Ok(payload.sha256.as_deref().map_or(true, |h| h == checksum(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_payload_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let a = store_payload(temp.path(), "a long prompt").unwrap();
        let b = store_payload(temp.path(), "a long prompt").unwrap();
        assert_eq!(a, b);
        assert_eq!(load_payload(temp.path(), &a).unwrap(), "a long prompt");
        assert!(verify_payload(temp.path(), &a).unwrap());

        std::fs::write(temp.path().join(&a.path), "tampered!!!!!").unwrap();
        assert!(!verify_payload(temp.path(), &a).unwrap());
    }

    #[test]
    fn test_payload_path_cannot_escape_run() {
        let temp = TempDir::new().unwrap();
        let evil = PayloadRef {
            path: "payloads/../../secret".to_string(),
            bytes: 1,
            sha256: None,
        };
        assert!(load_payload(temp.path(), &evil).is_err());
    }
}
