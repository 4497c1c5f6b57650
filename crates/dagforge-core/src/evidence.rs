//! Reads proof-of-work documents for jobs that mutate no tracked file.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{EvidenceFile, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceMethod {
    EvidenceFile,
    ExpectsNoChanges,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceVerdict {
    pub valid: bool,
    pub reason: String,
    #[serde(skip)]
    pub evidence: Option<EvidenceFile>,
    #[serde(skip)]
    pub method: Option<EvidenceMethod>,
}

pub trait EvidenceValidator: Send + Sync {
    fn validate(&self, worktree: &Path, node_id: NodeId, expects_no_changes: bool) -> Result<EvidenceVerdict>;
}

/// Reads `<worktree>/.orchestrator/evidence/<nodeId>.json`.
pub struct FileEvidenceValidator;

impl FileEvidenceValidator {
    pub fn new() -> Self {
        Self
    }

    fn evidence_path(worktree: &Path, node_id: NodeId) -> std::path::PathBuf {
        worktree
            .join(".orchestrator")
            .join("evidence")
            .join(format!("{node_id}.json"))
    }
}

impl Default for FileEvidenceValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl EvidenceValidator for FileEvidenceValidator {
    fn validate(&self, worktree: &Path, node_id: NodeId, expects_no_changes: bool) -> Result<EvidenceVerdict> {
        let path = Self::evidence_path(worktree, node_id);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return match serde_json::from_str::<EvidenceFile>(&raw) {
                Ok(evidence) if evidence.version == 1 => Ok(EvidenceVerdict {
                    valid: true,
                    reason: format!("evidence file satisfied: {}", evidence.summary),
                    evidence: Some(evidence),
                    method: Some(EvidenceMethod::EvidenceFile),
                }),
                Ok(evidence) => Ok(EvidenceVerdict {
                    valid: false,
                    reason: format!("unsupported evidence version {}", evidence.version),
                    evidence: None,
                    method: None,
                }),
                Err(e) => Ok(EvidenceVerdict {
                    valid: false,
                    reason: format!("malformed evidence file: {e}"),
                    evidence: None,
                    method: None,
                }),
            };
        }
        if expects_no_changes {
            return Ok(EvidenceVerdict {
                valid: true,
                reason: "node declared expectsNoChanges".to_string(),
                evidence: None,
                method: Some(EvidenceMethod::ExpectsNoChanges),
            });
        }
        Ok(EvidenceVerdict {
            valid: false,
            reason: "No work evidence produced.".to_string(),
            evidence: None,
            method: Some(EvidenceMethod::None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn missing_evidence_without_flag_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FileEvidenceValidator::new();
        let verdict = validator.validate(dir.path(), NodeId::new(), false).unwrap();
        assert!(!verdict.valid);
    }

    #[test]
    fn expects_no_changes_satisfies_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FileEvidenceValidator::new();
        let verdict = validator.validate(dir.path(), NodeId::new(), true).unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.method, Some(EvidenceMethod::ExpectsNoChanges));
    }

    #[test]
    fn well_formed_evidence_file_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let node_id = NodeId::new();
        let evidence_dir = dir.path().join(".orchestrator").join("evidence");
        fs::create_dir_all(&evidence_dir).unwrap();
        let evidence = EvidenceFile {
            version: 1,
            node_id,
            timestamp: Utc::now(),
            summary: "lint clean".to_string(),
            extra: Default::default(),
        };
        fs::write(
            evidence_dir.join(format!("{node_id}.json")),
            serde_json::to_string(&evidence).unwrap(),
        )
        .unwrap();
        let validator = FileEvidenceValidator::new();
        let verdict = validator.validate(dir.path(), node_id, false).unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.method, Some(EvidenceMethod::EvidenceFile));
    }
}
