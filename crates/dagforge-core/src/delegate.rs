//! Agent delegation seam: phases that need conflict resolution or `agent`
//! work hand off to this trait rather than knowing anything about a
//! concrete AI-agent CLI's prompt protocol.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct DelegateRequest {
    pub task: String,
    pub instructions: Option<String>,
    pub worktree_path: PathBuf,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub context_files: Vec<PathBuf>,
    pub max_turns: Option<u32>,
    pub extra_context: Option<String>,
    /// Streams delegate output into the job executor's log sink as it
    /// arrives, when the delegate supports incremental output.
    pub log: Option<LogCallback>,
}

#[derive(Debug, Clone, Default)]
pub struct DelegateOutcome {
    pub success: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub metrics: Option<Value>,
}

#[async_trait]
pub trait AgentDelegate: Send + Sync {
    async fn delegate(&self, request: DelegateRequest) -> Result<DelegateOutcome>;
}
