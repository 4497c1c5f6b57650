mod cli;
mod display;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dagforge_agent::{ClaudeBackend, CodexBackend, OllamaBackend};
use dagforge_core::config::Config;
use dagforge_core::delegate::AgentDelegate;
use dagforge_core::evidence::{EvidenceValidator, FileEvidenceValidator};
use dagforge_core::events::OrchestratorEvent;
use dagforge_core::git::{GitOps, ProcessGit};
use dagforge_core::persistence::{JsonFilePersistence, Persistence};
use dagforge_core::process::{ProcessSpawner, TokioSpawner};
use dagforge_core::runner::PlanRunner;
use dagforge_core::state_machine::StateMachine;
use dagforge_core::types::{Plan, PlanId, PlanSpec, PlanStatus};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

/// Picks the agent delegate backend from `DAGFORGE_AGENT_BACKEND`
/// (`claude` by default, also `codex`, `ollama`).
fn build_delegate() -> Arc<dyn AgentDelegate> {
    match std::env::var("DAGFORGE_AGENT_BACKEND").as_deref() {
        Ok("codex") => {
            let api_key = std::env::var("CODEX_API_KEY").unwrap_or_default();
            let model = std::env::var("CODEX_MODEL").unwrap_or_else(|_| "gpt-5-codex".to_string());
            Arc::new(CodexBackend::new(api_key, model))
        }
        Ok("ollama") => {
            let base_url =
                std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
            let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3".to_string());
            Arc::new(OllamaBackend::new(base_url, model))
        }
        _ => {
            let claude_bin = std::env::var("CLAUDE_BIN").unwrap_or_else(|_| "claude".to_string());
            Arc::new(ClaudeBackend::new(claude_bin))
        }
    }
}

fn parse_plan_id(raw: &str) -> Result<PlanId> {
    PlanId::from_str(raw).map_err(|e| anyhow!("invalid plan id {raw:?}: {e}"))
}

/// Derives a plan's current status the way the pump does, without needing
/// the runner's internal state machine.
fn plan_status(plan: &Plan) -> PlanStatus {
    let mut scratch = plan.clone();
    let sm = StateMachine::new(&mut scratch);
    sm.compute_plan_status()
}

fn is_terminal(status: PlanStatus) -> bool {
    matches!(status, PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Canceled)
}

async fn build_runner(config: Config) -> Result<Arc<PlanRunner>> {
    std::fs::create_dir_all(&config.storage_path)
        .with_context(|| format!("creating storage dir {}", config.storage_path.display()))?;

    let git: Arc<dyn GitOps> = Arc::new(ProcessGit::new());
    let spawner: Arc<dyn ProcessSpawner> = Arc::new(TokioSpawner::new());
    let delegate = build_delegate();
    let evidence: Arc<dyn EvidenceValidator> = Arc::new(FileEvidenceValidator::new());
    let persistence: Arc<dyn Persistence> = Arc::new(JsonFilePersistence::new(config.storage_path.clone())?);

    let runner = PlanRunner::new(git, spawner, delegate, evidence, persistence, Arc::new(config));
    runner.initialize().await?;
    Ok(runner)
}

async fn watch_plan(runner: &Arc<PlanRunner>, plan_id: PlanId) -> Result<()> {
    let mut events = runner.subscribe();
    loop {
        let Some(plan) = runner.plan(plan_id).await else {
            return Err(anyhow!("plan {plan_id} disappeared while watching"));
        };
        let status = plan_status(&plan);
        if is_terminal(status) {
            display::print_plan_status(&plan);
            println!("{}", display::overall_status_line(&plan, status));
            return Ok(());
        }
        match events.recv().await {
            Ok(OrchestratorEvent::PlanCompleted { plan, status }) if plan.id == plan_id => {
                display::print_plan_status(&plan);
                println!("{}", display::overall_status_line(&plan, status));
                return Ok(());
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(anyhow!("event stream closed before plan {plan_id} finished"));
            }
        }
    }
}

async fn run(cli: Cli, runner: Arc<PlanRunner>) -> Result<()> {
    match cli.command {
        Command::Submit { plan_file, watch } => {
            let spec = read_plan_spec(&plan_file)?;
            let plan_id = runner.enqueue(spec).await?;
            println!("{plan_id}");
            if watch {
                watch_plan(&runner, plan_id).await?;
            }
        }
        Command::Status { plan_id } => {
            let plan_id = parse_plan_id(&plan_id)?;
            let plan = runner
                .plan(plan_id)
                .await
                .ok_or_else(|| anyhow!("no such plan: {plan_id}"))?;
            let status = plan_status(&plan);
            display::print_plan_status(&plan);
            println!("{}", display::overall_status_line(&plan, status));
        }
        Command::List => {
            let mut plans = runner.list_plans().await;
            plans.sort_by_key(|p| p.created_at);
            for plan in plans {
                let status = plan_status(&plan);
                println!("{}  {:<24}  {:?}", plan.id, plan.spec.name, status);
            }
        }
        Command::Cancel { plan_id } => {
            runner.cancel(parse_plan_id(&plan_id)?).await?;
        }
        Command::Pause { plan_id } => {
            runner.pause(parse_plan_id(&plan_id)?).await?;
        }
        Command::Resume { plan_id } => {
            runner.resume(parse_plan_id(&plan_id)?).await?;
        }
        Command::Delete { plan_id } => {
            runner.delete(parse_plan_id(&plan_id)?).await?;
        }
        Command::Logs {
            plan_id,
            producer_id,
            attempt,
        } => {
            let plan_id = parse_plan_id(&plan_id)?;
            let plan = runner
                .plan(plan_id)
                .await
                .ok_or_else(|| anyhow!("no such plan: {plan_id}"))?;
            let node_id = *plan
                .producer_id_to_node_id
                .get(&producer_id)
                .ok_or_else(|| anyhow!("no node with producerId {producer_id:?} in plan {plan_id}"))?;
            let attempt = match attempt {
                Some(a) => a,
                None => plan
                    .state(node_id)
                    .map(|s| s.attempts)
                    .ok_or_else(|| anyhow!("node {producer_id} has no recorded state"))?,
            };
            let (bytes, _offset) = runner.read_log(plan_id, node_id, attempt, 0)?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
    }
    Ok(())
}

fn read_plan_spec(path: &PathBuf) -> Result<PlanSpec> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading plan file {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing plan file {}", path.display()))
}

fn init_tracing(log_filter: &str) {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_filter);

    let cli = Cli::parse();
    let runner = build_runner(config).await?;
    run(cli, runner).await
}
