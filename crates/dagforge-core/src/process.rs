//! Process spawning seam consumed by the work/prechecks/postchecks phases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Run through a shell instead of exec'ing the executable directly.
    pub shell_command: Option<String>,
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn SpawnedProcess>>;
}

#[async_trait]
pub trait SpawnedProcess: Send {
    fn pid(&self) -> Option<u32>;

    async fn wait_with_streaming(
        &mut self,
        on_line: &mut (dyn FnMut(StreamKind, &str) + Send),
    ) -> Result<ExitOutcome>;

    async fn kill_tree(&mut self) -> Result<()>;
}

/// Default [`ProcessSpawner`] backed by `tokio::process::Command`.
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn SpawnedProcess>> {
        let mut cmd = match &spec.shell_command {
            Some(command) => {
                let mut cmd = tokio::process::Command::new(&spec.executable);
                cmd.arg(&spec.args.first().cloned().unwrap_or_else(|| "-c".to_string()));
                cmd.arg(command);
                cmd
            }
            None => {
                let mut cmd = tokio::process::Command::new(&spec.executable);
                cmd.args(&spec.args);
                cmd
            }
        };
        cmd.current_dir(&spec.cwd);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        set_process_group(&mut cmd);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", spec.executable))?;
        Ok(Box::new(TokioSpawnedProcess { child: Some(child) }))
    }
}

#[cfg(unix)]
fn set_process_group(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_process_group(_cmd: &mut tokio::process::Command) {}

struct TokioSpawnedProcess {
    child: Option<tokio::process::Child>,
}

#[async_trait]
impl SpawnedProcess for TokioSpawnedProcess {
    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    async fn wait_with_streaming(
        &mut self,
        on_line: &mut (dyn FnMut(StreamKind, &str) + Send),
    ) -> Result<ExitOutcome> {
        let mut child = self
            .child
            .take()
            .context("process already waited on")?;
        let stdout = child.stdout.take().context("stdout not piped")?;
        let stderr = child.stderr.take().context("stderr not piped")?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line.context("error reading stdout")? {
                        Some(l) => on_line(StreamKind::Stdout, &l),
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(l)) = line {
                        on_line(StreamKind::Stderr, &l);
                    }
                }
            }
        }
        while let Ok(Some(l)) = stderr_lines.next_line().await {
            on_line(StreamKind::Stderr, &l);
        }

        let status = child.wait().await.context("failed to wait for child")?;
        Ok(ExitOutcome {
            success: status.success(),
            exit_code: status.code(),
        })
    }

    async fn kill_tree(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };
        kill_process_tree(pid);
        let _ = child.kill().await;
        Ok(())
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    // We run children in their own session (setsid); signal the whole group.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_process_tree(_pid: u32) {
    warn!("process-tree kill is unix-only; falling back to direct child kill");
}

/// Builds a [`SpawnSpec`] for the platform's default shell, mirroring the
/// spec's `{cmd, powershell, pwsh, bash, sh, default}` shell choice.
pub fn shell_spawn_spec(
    kind: crate::types::ShellKind,
    command: &str,
    cwd: &Path,
    env: HashMap<String, String>,
) -> SpawnSpec {
    use crate::types::ShellKind;
    let (executable, flag) = match kind {
        ShellKind::Cmd => ("cmd", "/C"),
        ShellKind::PowerShell => ("powershell", "-Command"),
        ShellKind::Pwsh => ("pwsh", "-Command"),
        ShellKind::Bash => ("bash", "-c"),
        ShellKind::Sh | ShellKind::Default => {
            if cfg!(windows) {
                ("cmd", "/C")
            } else {
                ("sh", "-c")
            }
        }
    };
    SpawnSpec {
        executable: executable.to_string(),
        args: vec![flag.to_string()],
        cwd: cwd.to_path_buf(),
        env,
        shell_command: Some(command.to_string()),
    }
}
