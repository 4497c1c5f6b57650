use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dagforge_core::delegate::{AgentDelegate, DelegateOutcome, DelegateRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Runs Claude Code as a subprocess and streams its NDJSON output back
/// through the delegate request's log callback.
pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    /// Kill subprocess and return failure after this many seconds (0 = no limit).
    pub timeout_s: u64,
    /// Tools the agent is allowed to invoke.
    pub allowed_tools: String,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            timeout_s: 0,
            allowed_tools: "Read,Glob,Grep,Write,Edit,Bash".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_allowed_tools(mut self, tools: impl Into<String>) -> Self {
        self.allowed_tools = tools.into();
        self
    }
}

#[async_trait]
impl AgentDelegate for ClaudeBackend {
    async fn delegate(&self, request: DelegateRequest) -> Result<DelegateOutcome> {
        let instruction = crate::instruction::build_instruction(&request);

        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.clone(),
        ];
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(max_turns) = request.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(session_id) = &request.session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args.push("--print".to_string());
        args.push(instruction);

        info!(
            worktree = %request.worktree_path.display(),
            session_id = ?request.session_id,
            "spawning claude subprocess"
        );

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .kill_on_drop(true)
            .current_dir(&request.worktree_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let log = request.log.clone();

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                if let Some(cb) = &log {
                                    cb(&l);
                                }
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!("claude stderr: {}", l);
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!("claude stderr: {}", l);
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status.code(), exit_status.success()))
        };

        let (raw_stream, exit_code, success) = if self.timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(self.timeout_s), io_future).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    warn!(timeout_s = self.timeout_s, "claude subprocess timed out");
                    return Ok(DelegateOutcome {
                        success: false,
                        error: Some(format!("claude subprocess timed out after {}s", self.timeout_s)),
                        ..Default::default()
                    });
                }
            }
        } else {
            io_future.await?
        };

        let (output, new_session_id) = crate::event::parse_stream(&raw_stream);

        info!(success, new_session_id = ?new_session_id, output_len = output.len(), "claude subprocess finished");

        Ok(DelegateOutcome {
            success,
            session_id: new_session_id,
            error: if success { None } else { Some(output) },
            exit_code,
            metrics: None,
        })
    }
}
