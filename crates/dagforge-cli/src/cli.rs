use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dagforge", version, about = "DAG-based job orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Submit a plan spec (JSON) and print its assigned plan id.
    Submit {
        /// Path to a PlanSpec JSON file.
        plan_file: PathBuf,
        /// Block until the plan reaches a terminal status, printing progress.
        #[arg(long)]
        watch: bool,
    },
    /// Print the status of every node in a plan.
    Status {
        plan_id: String,
    },
    /// List every plan known to this runner.
    List,
    /// Cancel every in-flight node of a plan.
    Cancel {
        plan_id: String,
    },
    /// Stop dispatching new nodes for a plan; in-flight nodes finish normally.
    Pause {
        plan_id: String,
    },
    /// Resume a previously paused plan.
    Resume {
        plan_id: String,
    },
    /// Remove a plan's persisted state and any remaining worktrees.
    Delete {
        plan_id: String,
    },
    /// Print a node's captured stdout/stderr log.
    Logs {
        plan_id: String,
        producer_id: String,
        /// Attempt number to read; defaults to the latest.
        #[arg(long)]
        attempt: Option<u32>,
    },
}
