use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Opaque identifiers ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── WorkSpec ─────────────────────────────────────────────────────────────

/// Agent-delegation sentinel recognized by the legacy string variant.
pub const AGENT_SENTINEL: &str = "@agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Cmd,
    PowerShell,
    Pwsh,
    Bash,
    Sh,
    #[serde(rename = "default")]
    Default,
}

/// Work to perform during prechecks, work, or postchecks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkSpec {
    /// Legacy form: a bare shell command, or an agent delegation when the
    /// string is prefixed with [`AGENT_SENTINEL`].
    Legacy { command: String },
    Process {
        executable: String,
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Shell {
        command: String,
        #[serde(default = "default_shell_kind")]
        shell: ShellKind,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Agent {
        instructions: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        context_files: Vec<PathBuf>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        extra_context: Option<String>,
    },
}

fn default_shell_kind() -> ShellKind {
    ShellKind::Default
}

impl WorkSpec {
    /// True if this spec's legacy string form begins with the agent sentinel.
    pub fn is_legacy_agent(&self) -> bool {
        matches!(self, WorkSpec::Legacy { command } if command.trim_start().starts_with(AGENT_SENTINEL))
    }
}

// ── PlanSpec (input) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNodeSpec {
    pub producer_id: String,
    pub name: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub work: Option<WorkSpec>,
    #[serde(default)]
    pub prechecks: Option<WorkSpec>,
    #[serde(default)]
    pub postchecks: Option<WorkSpec>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the plan's base branch for this job's initial worktree.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Declares that this job's work legitimately produces no tracked-file
    /// changes; satisfies the commit phase without an evidence file.
    #[serde(default)]
    pub expects_no_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPlanNodeSpec {
    pub producer_id: String,
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub plan: Box<PlanSpec>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default = "default_true")]
    pub clean_up_successful_work: bool,
    #[serde(default)]
    pub jobs: Vec<JobNodeSpec>,
    #[serde(default)]
    pub sub_plans: Vec<SubPlanNodeSpec>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_parallel() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

// ── Node (post-build) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNode {
    pub task: String,
    pub work: Option<WorkSpec>,
    pub prechecks: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    pub instructions: Option<String>,
    pub base_branch: Option<String>,
    pub expects_no_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPlanNode {
    pub spec: Box<PlanSpec>,
    pub max_parallel: Option<u32>,
    /// Set once the sub-plan has been instantiated and registered by the runner.
    pub child_plan_id: Option<PlanId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeKind {
    Job(JobNode),
    SubPlan(SubPlanNode),
}

impl NodeKind {
    /// True for nodes that perform no actual work and therefore don't
    /// consume a parallelism slot ("coordination" nodes).
    pub fn is_coordination(&self) -> bool {
        match self {
            NodeKind::SubPlan(_) => true,
            NodeKind::Job(j) => j.work.is_none(),
        }
    }

    pub fn as_job(&self) -> Option<&JobNode> {
        match self {
            NodeKind::Job(j) => Some(j),
            NodeKind::SubPlan(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub producer_id: String,
    pub name: String,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub kind: NodeKind,
}

// ── NodeExecutionState ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled
        )
    }

    /// The set of statuses this one may legally transition into.
    pub fn allowed_next(self) -> &'static [NodeStatus] {
        use NodeStatus::*;
        match self {
            Pending => &[Ready, Blocked, Canceled],
            Ready => &[Scheduled, Blocked, Canceled],
            Scheduled => &[Running, Failed, Canceled],
            Running => &[Succeeded, Failed, Canceled],
            Succeeded | Failed | Blocked | Canceled => &[],
        }
    }

    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    MergeFi,
    Setup,
    Prechecks,
    Work,
    Commit,
    Postchecks,
    MergeRi,
}

impl PhaseName {
    pub const ORDER: [PhaseName; 7] = [
        PhaseName::MergeFi,
        PhaseName::Setup,
        PhaseName::Prechecks,
        PhaseName::Work,
        PhaseName::Commit,
        PhaseName::Postchecks,
        PhaseName::MergeRi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::MergeFi => "merge-fi",
            PhaseName::Setup => "setup",
            PhaseName::Prechecks => "prechecks",
            PhaseName::Work => "work",
            PhaseName::Commit => "commit",
            PhaseName::Postchecks => "postchecks",
            PhaseName::MergeRi => "merge-ri",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregated commit/file counters for a node (and, rolled up, its descendants).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub commits: u32,
    pub files_added: u32,
    pub files_modified: u32,
    pub files_deleted: u32,
}

impl WorkSummary {
    pub fn merge(&self, other: &WorkSummary) -> WorkSummary {
        WorkSummary {
            commits: self.commits + other.commits,
            files_added: self.files_added + other.files_added,
            files_modified: self.files_modified + other.files_modified,
            files_deleted: self.files_deleted + other.files_deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub status: NodeStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub base_commit: Option<String>,
    pub completed_commit: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub child_plan_id: Option<PlanId>,
    /// Unset until a merge-ri has been attempted for a leaf with a target branch.
    pub merged_to_target: Option<bool>,
    pub worktree_cleaned_up: bool,
    pub step_statuses: HashMap<PhaseName, StepStatus>,
    pub work_summary: WorkSummary,
    pub aggregated_work_summary: WorkSummary,
    pub version: u64,
}

impl NodeExecutionState {
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            attempts: 0,
            pid: None,
            error: None,
            base_commit: None,
            completed_commit: None,
            worktree_path: None,
            child_plan_id: None,
            merged_to_target: None,
            worktree_cleaned_up: false,
            step_statuses: HashMap::new(),
            work_summary: WorkSummary::default(),
            aggregated_work_summary: WorkSummary::default(),
            version: 0,
        }
    }
}

// ── Plan ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
    Canceled,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub spec: PlanSpec,
    pub nodes: HashMap<NodeId, Node>,
    pub producer_id_to_node_id: HashMap<String, NodeId>,
    pub roots: Vec<NodeId>,
    pub leaves: Vec<NodeId>,
    pub node_states: HashMap<NodeId, NodeExecutionState>,
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub target_branch: Option<String>,
    pub worktree_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub clean_up_successful_work: bool,
    pub max_parallel: u32,
    pub is_paused: bool,
    pub state_version: u64,
    pub work_summary: WorkSummary,
}

impl Plan {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn state(&self, id: NodeId) -> Option<&NodeExecutionState> {
        self.node_states.get(&id)
    }

    pub fn status_of(&self, id: NodeId) -> Option<NodeStatus> {
        self.node_states.get(&id).map(|s| s.status)
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.leaves.contains(&id)
    }
}

// ── Evidence ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceFile {
    pub version: u32,
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

// ── Index entry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanIndexEntry {
    pub id: PlanId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
