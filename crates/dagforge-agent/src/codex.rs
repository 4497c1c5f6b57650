use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dagforge_core::delegate::{AgentDelegate, DelegateOutcome, DelegateRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Runs Codex (openai/codex) as the delegate backend via `--full-auto` mode.
///
/// The codex app-server JSON-RPC protocol is planned but not yet wired up;
/// output is only ever collected as plain text.
pub struct CodexBackend {
    pub api_key: String,
    pub model: String,
    pub codex_bin: String,
}

impl CodexBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            codex_bin: "codex".into(),
        }
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.codex_bin = bin.into();
        self
    }

    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.codex_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AgentDelegate for CodexBackend {
    async fn delegate(&self, request: DelegateRequest) -> Result<DelegateOutcome> {
        if !self.is_available().await {
            bail!("codex binary not found: {}", self.codex_bin);
        }

        let instruction = crate::instruction::build_instruction(&request);
        let model = request.model.as_deref().unwrap_or(&self.model);

        info!(worktree = %request.worktree_path.display(), model, "spawning codex subprocess");

        let mut child = tokio::process::Command::new(&self.codex_bin)
            .arg("--model")
            .arg(model)
            .arg("--approval-mode")
            .arg("full-auto")
            .arg(&instruction)
            .current_dir(&request.worktree_path)
            .env("OPENAI_API_KEY", &self.api_key)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn codex binary: {}", self.codex_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let mut output_lines = Vec::new();
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let log = request.log.clone();

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line.context("error reading stdout")? {
                        Some(l) => {
                            if let Some(cb) = &log {
                                cb(&l);
                            }
                            output_lines.push(l);
                        }
                        None => break,
                    }
                }
                line = stderr_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!("codex stderr: {}", l);
                        }
                    }
                }
            }
        }

        while let Ok(Some(l)) = stderr_reader.next_line().await {
            if !l.is_empty() {
                warn!("codex stderr: {}", l);
            }
        }

        let exit_status = child.wait().await.context("failed to wait for codex process")?;
        let output = output_lines.join("\n");
        let success = exit_status.success();

        info!(success, output_len = output.len(), "codex subprocess finished");

        Ok(DelegateOutcome {
            success,
            session_id: None,
            error: if success { None } else { Some(output) },
            exit_code: exit_status.code(),
            metrics: None,
        })
    }
}
