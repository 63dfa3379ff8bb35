//! In-memory container runtime for tests and local runs without docker.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerStatus, RuntimeError};

#[derive(Debug)]
struct Group {
    dir: PathBuf,
    ups: u32,
}

#[derive(Debug, Default)]
struct Inner {
    groups: HashMap<String, Group>,
    volumes: HashSet<String>,
    networks: HashSet<String>,
    builds: HashMap<String, u32>,
    status: HashMap<String, Vec<ContainerStatus>>,
    failures: HashMap<&'static str, String>,
    latency: Duration,
}

/// Models compose groups in memory. A group that is up reports a healthy
/// `dev` and `agent` container unless [`InMemoryRuntime::set_status`]
/// overrides it.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override what `status` reports for `project`.
    pub fn set_status(&self, project: &str, containers: Vec<ContainerStatus>) {
        self.lock().status.insert(project.to_string(), containers);
    }

    pub fn clear_status(&self, project: &str) {
        self.lock().status.remove(project);
    }

    /// Make the next call of `op` (`"up"`, `"down"`, `"build"`, ...) fail.
    pub fn fail_next(&self, op: &'static str, message: impl Into<String>) {
        self.lock().failures.insert(op, message.into());
    }

    /// Make `up` and `build` take this long, like pulls and image builds do.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn is_up(&self, project: &str) -> bool {
        self.lock().groups.contains_key(project)
    }

    /// Names of all groups currently up, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.lock().groups.keys().cloned().collect();
        groups.sort();
        groups
    }

    pub fn up_count(&self, project: &str) -> u32 {
        self.lock().groups.get(project).map_or(0, |g| g.ups)
    }

    pub fn dir_of(&self, project: &str) -> Option<PathBuf> {
        self.lock().groups.get(project).map(|g| g.dir.clone())
    }

    pub fn build_count(&self, project: &str) -> u32 {
        self.lock().builds.get(project).copied().unwrap_or(0)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    fn check(inner: &mut Inner, op: &'static str) -> Result<(), RuntimeError> {
        match inner.failures.remove(op) {
            Some(stderr) => Err(RuntimeError::CommandFailed {
                cmd: "docker".to_string(),
                args: vec!["compose".to_string(), op.to_string()],
                stderr,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn up(
        &self,
        project: &str,
        dir: &Path,
        _preserve_others: bool,
    ) -> Result<(), RuntimeError> {
        self.delay().await;
        let mut inner = self.lock();
        Self::check(&mut inner, "up")?;
        let group = inner
            .groups
            .entry(project.to_string())
            .or_insert_with(|| Group {
                dir: dir.to_path_buf(),
                ups: 0,
            });
        group.dir = dir.to_path_buf();
        group.ups += 1;
        Ok(())
    }

    async fn down(&self, project: &str, _dir: &Path) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check(&mut inner, "down")?;
        inner.groups.remove(project);
        Ok(())
    }

    async fn down_with_volumes(&self, project: &str, _dir: &Path) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check(&mut inner, "down_with_volumes")?;
        inner.groups.remove(project);
        let prefix = format!("{project}-");
        inner.volumes.retain(|v| !v.starts_with(&prefix));
        Ok(())
    }

    async fn build(&self, project: &str, _dir: &Path) -> Result<(), RuntimeError> {
        self.delay().await;
        let mut inner = self.lock();
        Self::check(&mut inner, "build")?;
        *inner.builds.entry(project.to_string()).or_default() += 1;
        Ok(())
    }

    async fn status(
        &self,
        project: &str,
        _dir: &Path,
    ) -> Result<Vec<ContainerStatus>, RuntimeError> {
        let mut inner = self.lock();
        Self::check(&mut inner, "status")?;
        if let Some(containers) = inner.status.get(project) {
            return Ok(containers.clone());
        }
        if inner.groups.contains_key(project) {
            Ok(vec![
                ContainerStatus::running("dev", project),
                ContainerStatus::running("agent", project),
            ])
        } else {
            Ok(Vec::new())
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check(&mut inner, "ensure_volume")?;
        inner.volumes.insert(name.to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check(&mut inner, "ensure_network")?;
        inner.networks.insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{readiness, Readiness};

    #[tokio::test]
    async fn up_twice_leaves_one_group() {
        let runtime = InMemoryRuntime::new();
        let dir = Path::new("/tmp/sc-p1");

        runtime.up("sc-p1", dir, false).await.unwrap();
        runtime.up("sc-p1", dir, false).await.unwrap();

        assert_eq!(runtime.groups(), ["sc-p1"]);
        assert_eq!(runtime.up_count("sc-p1"), 2);
        assert_eq!(runtime.status("sc-p1", dir).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn down_is_idempotent() {
        let runtime = InMemoryRuntime::new();
        let dir = Path::new("/tmp/sc-p1");

        runtime.down("sc-p1", dir).await.unwrap();
        runtime.up("sc-p1", dir, true).await.unwrap();
        runtime.down("sc-p1", dir).await.unwrap();
        runtime.down("sc-p1", dir).await.unwrap();

        assert!(!runtime.is_up("sc-p1"));
        assert_eq!(readiness(&runtime.status("sc-p1", dir).await.unwrap()), Readiness::Pending);
    }

    #[tokio::test]
    async fn volumes_survive_down_but_not_down_with_volumes() {
        let runtime = InMemoryRuntime::new();
        let dir = Path::new("/tmp/sc-p1");
        runtime.ensure_volume("sc-p1-workspace").await.unwrap();
        runtime.ensure_volume("sc-p1-workspace").await.unwrap();
        runtime.up("sc-p1", dir, false).await.unwrap();

        runtime.down("sc-p1", dir).await.unwrap();
        assert!(runtime.has_volume("sc-p1-workspace"));

        runtime.down_with_volumes("sc-p1", dir).await.unwrap();
        assert!(!runtime.has_volume("sc-p1-workspace"));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let runtime = InMemoryRuntime::new();
        let dir = Path::new("/tmp/sc-p1");
        runtime.fail_next("up", "daemon unreachable");

        let err = runtime.up("sc-p1", dir, false).await.unwrap_err();
        assert!(err.to_string().contains("daemon unreachable"));
        runtime.up("sc-p1", dir, false).await.unwrap();
    }
}
