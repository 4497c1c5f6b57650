//! Crash-safe JSON persistence: one file per plan plus a directory index,
//! written atomically via temp-file-then-rename.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{error, warn};

use crate::types::{NodeStatus, Plan, PlanId, PlanIndexEntry};

pub trait Persistence: Send + Sync {
    fn save(&self, plan: &Plan) -> Result<()>;
    fn load(&self, id: PlanId) -> Result<Option<Plan>>;
    fn load_all(&self) -> Result<Vec<Plan>>;
    fn delete(&self, id: PlanId) -> Result<()>;
    fn list_index(&self) -> Result<Vec<PlanIndexEntry>>;
}

/// Filesystem-backed implementation: `<storagePath>/plan-<id>.json` per plan,
/// `<storagePath>/plans-index.json` index.
pub struct JsonFilePersistence {
    storage_path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path)
            .with_context(|| format!("failed to create storage dir {}", storage_path.display()))?;
        Ok(Self { storage_path })
    }

    fn plan_path(&self, id: PlanId) -> PathBuf {
        self.storage_path.join(format!("plan-{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.storage_path.join("plans-index.json")
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.storage_path);
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        use std::io::Write;
        tmp.write_all(contents)
            .with_context(|| "failed to write temp file contents")?;
        tmp.persist(path)
            .map_err(|e| anyhow::anyhow!("failed to persist {}: {e}", path.display()))?;
        Ok(())
    }

    fn read_index(&self) -> Vec<PlanIndexEntry> {
        let path = self.index_path();
        if !path.exists() {
            return Vec::new();
        }
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "corrupted plans index, treating as empty");
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to read plans index, treating as empty");
                Vec::new()
            }
        }
    }

    fn write_index(&self, entries: &[PlanIndexEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        self.write_atomic(&self.index_path(), &json)
    }
}

impl Persistence for JsonFilePersistence {
    fn save(&self, plan: &Plan) -> Result<()> {
        let json = serde_json::to_vec_pretty(plan)?;
        self.write_atomic(&self.plan_path(plan.id), &json)?;

        let mut index = self.read_index();
        if let Some(entry) = index.iter_mut().find(|e| e.id == plan.id) {
            entry.name = plan.spec.name.clone();
        } else {
            index.push(PlanIndexEntry {
                id: plan.id,
                name: plan.spec.name.clone(),
                created_at: plan.created_at,
            });
        }
        self.write_index(&index)?;
        Ok(())
    }

    fn load(&self, id: PlanId) -> Result<Option<Plan>> {
        let path = self.plan_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let mut plan: Plan = match serde_json::from_str(&raw) {
            Ok(plan) => plan,
            Err(e) => {
                error!(plan_id = %id, error = %e, "corrupted plan file, skipping");
                return Ok(None);
            }
        };
        normalize_crashed(&mut plan);
        Ok(Some(plan))
    }

    fn load_all(&self) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        for entry in self.read_index() {
            if let Some(plan) = self.load(entry.id)? {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    fn delete(&self, id: PlanId) -> Result<()> {
        let path = self.plan_path(id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete plan file {}", path.display()))?;
        }
        let mut index = self.read_index();
        index.retain(|e| e.id != id);
        self.write_index(&index)?;
        Ok(())
    }

    fn list_index(&self) -> Result<Vec<PlanIndexEntry>> {
        Ok(self.read_index())
    }
}

/// Any node with status `running` is normalized to `failed` on load, because
/// the process that owned it is gone.
fn normalize_crashed(plan: &mut Plan) {
    for state in plan.node_states.values_mut() {
        if state.status == NodeStatus::Running {
            state.status = NodeStatus::Failed;
            state.error = Some("crashed before restart".to_string());
            state.pid = None;
            state.ended_at = state.ended_at.or_else(|| Some(chrono::Utc::now()));
            state.version += 1;
        }
    }
}
