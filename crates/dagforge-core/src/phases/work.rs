//! Dispatches a [`WorkSpec`] for the prechecks, work, and postchecks phases.
//!
//! All three phases share this dispatcher: they differ only in which
//! [`WorkSpec`] the node carries and which [`PhaseName`] is recorded.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::delegate::DelegateRequest;
use crate::process::{shell_spawn_spec, SpawnSpec, StreamKind};
use crate::types::{PhaseName, ShellKind, WorkSpec, AGENT_SENTINEL};

use super::{LogKind, PhaseContext, PhaseDeps, PhaseResult};

pub async fn run_work_phase(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    phase: PhaseName,
    spec: &WorkSpec,
) -> PhaseResult {
    if ctx.is_aborted() {
        return PhaseResult::canceled();
    }

    match spec {
        WorkSpec::Legacy { command } => {
            if spec.is_legacy_agent() {
                let instructions = command
                    .trim_start()
                    .strip_prefix(AGENT_SENTINEL)
                    .unwrap_or(command)
                    .trim()
                    .to_string();
                run_agent(ctx, deps, phase, &instructions, None, &[], None, None).await
            } else {
                let spawn = shell_spawn_spec(ShellKind::Default, command, &ctx.worktree_path, ctx.env.clone());
                run_process(ctx, deps, phase, spawn, None).await
            }
        }
        WorkSpec::Process {
            executable,
            args,
            env,
            cwd,
            timeout_secs,
        } => {
            let mut merged_env = ctx.env.clone();
            merged_env.extend(env.clone());
            let spawn = SpawnSpec {
                executable: executable.clone(),
                args: args.clone(),
                cwd: cwd.clone().unwrap_or_else(|| ctx.worktree_path.clone()),
                env: merged_env,
                shell_command: None,
            };
            run_process(ctx, deps, phase, spawn, *timeout_secs).await
        }
        WorkSpec::Shell {
            command,
            shell,
            env,
            cwd,
            timeout_secs,
        } => {
            let mut merged_env = ctx.env.clone();
            merged_env.extend(env.clone());
            let cwd = cwd.clone().unwrap_or_else(|| ctx.worktree_path.clone());
            let spawn = shell_spawn_spec(*shell, command, &cwd, merged_env);
            run_process(ctx, deps, phase, spawn, *timeout_secs).await
        }
        WorkSpec::Agent {
            instructions,
            model,
            context_files,
            max_turns,
            extra_context,
        } => {
            run_agent(
                ctx,
                deps,
                phase,
                instructions,
                model.clone(),
                context_files,
                *max_turns,
                extra_context.clone(),
            )
            .await
        }
    }
}

async fn run_process(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    phase: PhaseName,
    spawn: SpawnSpec,
    timeout_secs: Option<u64>,
) -> PhaseResult {
    let mut spawned = match deps.spawner.spawn(&spawn).await {
        Ok(s) => s,
        Err(e) => return PhaseResult::failure(format!("failed to spawn process: {e}")),
    };
    ctx.registrar.set_pid(spawned.pid());
    ctx.registrar.set_start_time(Utc::now());
    ctx.registrar.set_is_agent_work(false);

    let log = ctx.log.clone();
    let mut on_line = move |kind: StreamKind, line: &str| {
        for segment in line.split('\n') {
            let log_kind = match kind {
                StreamKind::Stdout => LogKind::Stdout,
                StreamKind::Stderr => LogKind::Stderr,
            };
            log.log_output(phase, log_kind, segment);
        }
    };

    let aborted = ctx.aborted.clone();
    let wait_fut = spawned.wait_with_streaming(&mut on_line);
    let abort_watch = async {
        loop {
            if aborted.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    };

    let outcome = if let Some(secs) = timeout_secs.filter(|s| *s > 0) {
        tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(secs), wait_fut) => {
                match result {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(phase = %phase, secs, "phase timed out, killing process tree");
                        let _ = spawned.kill_tree().await;
                        return PhaseResult::failure(format!("phase {phase} timed out after {secs}s"));
                    }
                }
            }
            _ = abort_watch => {
                let _ = spawned.kill_tree().await;
                return PhaseResult::canceled();
            }
        }
    } else {
        tokio::select! {
            result = wait_fut => result,
            _ = abort_watch => {
                let _ = spawned.kill_tree().await;
                return PhaseResult::canceled();
            }
        }
    };

    match outcome {
        Ok(exit) if exit.success => PhaseResult {
            success: true,
            exit_code: exit.exit_code,
            ..Default::default()
        },
        Ok(exit) => PhaseResult {
            success: false,
            error: Some(format!("process exited with code {:?}", exit.exit_code)),
            exit_code: exit.exit_code,
            ..Default::default()
        },
        Err(e) => PhaseResult::failure(format!("process execution error: {e}")),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_agent(
    ctx: &PhaseContext,
    deps: &PhaseDeps,
    phase: PhaseName,
    instructions: &str,
    model: Option<String>,
    context_files: &[std::path::PathBuf],
    max_turns: Option<u32>,
    extra_context: Option<String>,
) -> PhaseResult {
    ctx.registrar.set_start_time(Utc::now());
    ctx.registrar.set_is_agent_work(true);

    let log = ctx.log.clone();
    let log_cb: crate::delegate::LogCallback = std::sync::Arc::new(move |line: &str| {
        for segment in line.split('\n') {
            log.log_output(phase, LogKind::Stdout, segment);
        }
    });

    let request = DelegateRequest {
        task: ctx.task.clone(),
        instructions: Some(instructions.to_string()),
        worktree_path: ctx.worktree_path.clone(),
        session_id: ctx.session_id.clone(),
        model,
        context_files: context_files.to_vec(),
        max_turns,
        extra_context,
        log: Some(log_cb),
    };

    if ctx.is_aborted() {
        return PhaseResult::canceled();
    }

    match deps.delegate.delegate(request).await {
        Ok(outcome) if outcome.success => PhaseResult {
            success: true,
            session_id: outcome.session_id,
            metrics: outcome.metrics,
            exit_code: outcome.exit_code,
            ..Default::default()
        },
        Ok(outcome) => PhaseResult {
            success: false,
            error: Some(outcome.error.unwrap_or_else(|| "agent delegation failed".to_string())),
            session_id: outcome.session_id,
            metrics: outcome.metrics,
            exit_code: outcome.exit_code,
            ..Default::default()
        },
        Err(e) => PhaseResult::failure(format!("agent delegation error: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::fakes::{test_ctx, test_deps};
    use crate::types::PhaseName;

    #[tokio::test]
    async fn legacy_command_without_sentinel_is_shell_work() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path().to_path_buf());
        let deps = test_deps();
        let spec = WorkSpec::Legacy {
            command: "@agent do the thing".to_string(),
        };
        // NoopDelegate panics on call; only reachable if dispatch correctly
        // routed to the agent branch. We just assert it's recognized here.
        assert!(spec.is_legacy_agent());
        let _ = (ctx, deps, spec);
    }

    #[test]
    fn phase_name_display_matches_spec_tags() {
        assert_eq!(PhaseName::Work.as_str(), "work");
        assert_eq!(PhaseName::Prechecks.as_str(), "prechecks");
    }
}
