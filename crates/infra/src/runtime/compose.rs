//! `docker compose` CLI runtime.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use super::{ContainerRuntime, ContainerState, ContainerStatus, HealthState, RuntimeError};

/// File name of the group definition inside a project directory.
pub const COMPOSE_FILE: &str = "compose.yaml";

/// Runtime backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    docker_bin: PathBuf,
}

impl ComposeCli {
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// `compose -p <project> [-f <dir>/compose.yaml]`.
    ///
    /// The file is optional so a group can still be taken down after its
    /// directory was removed.
    async fn compose_args(&self, project: &str, dir: &Path) -> Vec<String> {
        let mut args = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
        let file = dir.join(COMPOSE_FILE);
        if tokio::fs::try_exists(&file).await.unwrap_or(false) {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    async fn compose(
        &self,
        project: &str,
        dir: &Path,
        tail: &[&str],
    ) -> Result<String, RuntimeError> {
        let mut args = self.compose_args(project, dir).await;
        args.extend(tail.iter().map(|s| s.to_string()));
        self.run(&args).await
    }

    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let bin = self.docker_bin.display().to_string();
        trace!(cmd = %format!("{bin} {}", args.join(" ")), "running docker command");

        let output = Command::new(&self.docker_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(bin = %bin, "docker not found in PATH");
                    RuntimeError::NotInstalled(bin.clone())
                } else {
                    RuntimeError::Io(e)
                }
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::CommandFailed {
                cmd: bin,
                args: args.to_vec(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn ensure(&self, kind: &str, name: &str) -> Result<(), RuntimeError> {
        let inspect = [kind.to_string(), "inspect".to_string(), name.to_string()];
        if self.run(&inspect).await.is_ok() {
            return Ok(());
        }

        let create = [kind.to_string(), "create".to_string(), name.to_string()];
        match self.run(&create).await {
            Ok(_) => {
                debug!(kind, name, "created");
                Ok(())
            }
            // Lost a race with another worker.
            Err(RuntimeError::CommandFailed { stderr, .. }) if stderr.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for ComposeCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for ComposeCli {
    #[instrument(skip(self, dir), err)]
    async fn up(
        &self,
        project: &str,
        dir: &Path,
        preserve_others: bool,
    ) -> Result<(), RuntimeError> {
        let mut tail = vec!["up", "-d"];
        if !preserve_others {
            tail.push("--remove-orphans");
        }
        self.compose(project, dir, &tail).await?;
        debug!(project, "compose group up");
        Ok(())
    }

    #[instrument(skip(self, dir), err)]
    async fn down(&self, project: &str, dir: &Path) -> Result<(), RuntimeError> {
        self.compose(project, dir, &["down", "--remove-orphans"])
            .await?;
        debug!(project, "compose group down");
        Ok(())
    }

    #[instrument(skip(self, dir), err)]
    async fn down_with_volumes(&self, project: &str, dir: &Path) -> Result<(), RuntimeError> {
        self.compose(project, dir, &["down", "--volumes", "--remove-orphans"])
            .await?;
        debug!(project, "compose group removed with volumes");
        Ok(())
    }

    #[instrument(skip(self, dir), err)]
    async fn build(&self, project: &str, dir: &Path) -> Result<(), RuntimeError> {
        self.compose(project, dir, &["build"]).await?;
        Ok(())
    }

    #[instrument(skip(self, dir), err)]
    async fn status(&self, project: &str, dir: &Path) -> Result<Vec<ContainerStatus>, RuntimeError> {
        let out = self
            .compose(project, dir, &["ps", "--all", "--format", "json"])
            .await?;
        parse_ps(&out)
    }

    #[instrument(skip(self), err)]
    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.ensure("volume", name).await
    }

    #[instrument(skip(self), err)]
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.ensure("network", name).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    name: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
}

impl From<PsEntry> for ContainerStatus {
    fn from(e: PsEntry) -> Self {
        Self {
            name: e.name,
            service: e.service,
            state: ContainerState::parse(&e.state),
            health: HealthState::parse(&e.health),
        }
    }
}

/// Parse `compose ps --format json`, which is a JSON array on older compose
/// releases and one object per line on newer ones.
fn parse_ps(out: &str) -> Result<Vec<ContainerStatus>, RuntimeError> {
    let out = out.trim();
    if out.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PsEntry> = if out.starts_with('[') {
        serde_json::from_str(out).map_err(|e| RuntimeError::Parse(e.to_string()))?
    } else {
        out.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .map_err(|e| RuntimeError::Parse(e.to_string()))?
    };
    Ok(entries.into_iter().map(ContainerStatus::from).collect())
}
