use std::process::Stdio;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};

use fedlink_core::state::LinkState;
use fedlink_core::task::ConfigRecord;

/// Launches the child process representing a run. The servicer owns
/// the process afterwards; the executor only registers and builds it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn start_run(&self, fab_file: &[u8]) -> Result<RunLaunch>;
}

pub struct RunLaunch {
    pub run_id: u64,
    pub child: Child,
}

/// Default executor: registers the run under the bundle's content
/// hash, writes the bundle into a scratch workdir, and spawns the
/// configured command as `<command...> --run-id <id> <bundle>` with
/// piped stdio.
pub struct SubprocessExecutor {
    state: Arc<dyn LinkState>,
    command: Vec<String>,
    workdir: tempfile::TempDir,
}

impl SubprocessExecutor {
    pub fn new(state: Arc<dyn LinkState>, command: Vec<String>) -> Result<Self> {
        ensure!(!command.is_empty(), "run command must not be empty");
        Ok(Self {
            state,
            command,
            workdir: tempfile::tempdir().context("failed to create run workdir")?,
        })
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    async fn start_run(&self, fab_file: &[u8]) -> Result<RunLaunch> {
        let fab_hash = hex::encode(Sha256::digest(fab_file));
        let run_id = self
            .state
            .create_run("", "", &fab_hash, ConfigRecord::new())
            .await?;

        let fab_path = self.workdir.path().join(format!("{fab_hash}.fab"));
        tokio::fs::write(&fab_path, fab_file)
            .await
            .context("failed to write bundle to workdir")?;

        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg("--run-id")
            .arg(run_id.to_string())
            .arg(&fab_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command[0]))?;

        tracing::info!(run_id, %fab_hash, "spawned run process");
        Ok(RunLaunch { run_id, child })
    }
}
