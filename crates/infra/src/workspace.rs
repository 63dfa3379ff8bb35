//! Per-project workspace directories.
//!
//! ```text
//! <root>/<project>/compose.yaml            dev group definition
//! <root>/<project>/PROMPT.md               initial prompt
//! <root>/<project>/app/                    sources edited by the agent
//! <root>/<project>/.production/<hash>/     snapshot + production group
//! ```

use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::fs;
use tracing::{debug, instrument};

use sandcastle_core::ProjectId;
use sandcastle_projects::{
    compose_project_name, content_hash, production_project_name, volume_name, Project,
};

use crate::jobs::HandlerError;
use crate::runtime::compose::COMPOSE_FILE;

const APP_DIR: &str = "app";
const PRODUCTION_DIR: &str = ".production";
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Port the app listens on inside its container.
pub const APP_PORT: u16 = 3000;
/// Port the agent server listens on inside its container.
pub const AGENT_PORT: u16 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render {what}: {message}")]
    Render { what: &'static str, message: String },
}

impl From<WorkspaceError> for HandlerError {
    fn from(err: WorkspaceError) -> Self {
        HandlerError::transient(err.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Images and network the generated groups use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSettings {
    pub dev_image: String,
    pub agent_image: String,
    pub network: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            dev_image: "node:22-bookworm".to_string(),
            agent_image: "ghcr.io/sst/opencode:latest".to_string(),
            network: "sandcastle-edge".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    settings: WorkspaceSettings,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, settings: WorkspaceSettings) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn project_dir(&self, id: &ProjectId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn app_dir(&self, id: &ProjectId) -> PathBuf {
        self.project_dir(id).join(APP_DIR)
    }

    pub fn production_dir(&self, id: &ProjectId, hash: &str) -> PathBuf {
        self.project_dir(id).join(PRODUCTION_DIR).join(hash)
    }

    /// Write the dev group definition, the prompt and the app directory.
    /// Safe to repeat; existing app sources are left alone.
    #[instrument(skip(self, project), fields(project_id = %project.id), err)]
    pub async fn prepare(&self, project: &Project) -> Result<PathBuf, WorkspaceError> {
        let dir = self.project_dir(&project.id);
        let app = self.app_dir(&project.id);
        fs::create_dir_all(&app).await.map_err(io_err(&app))?;

        let compose = render("dev compose file", &self.dev_compose(&project.id))?;
        write(&dir.join(COMPOSE_FILE), compose.as_bytes()).await?;
        write(&dir.join("PROMPT.md"), project.prompt.as_bytes()).await?;

        debug!(dir = %dir.display(), "workspace prepared");
        Ok(dir)
    }

    /// Hash of the app sources; identifies a production build.
    #[instrument(skip(self), fields(project_id = %id), err)]
    pub async fn content_hash(&self, id: &ProjectId) -> Result<String, WorkspaceError> {
        let files = collect_files(&self.app_dir(id)).await?;
        Ok(content_hash(files))
    }

    /// Snapshot the app sources into `.production/<hash>/` and write the
    /// production group definition next to them.
    #[instrument(skip(self), fields(project_id = %id), err)]
    pub async fn write_production(
        &self,
        id: &ProjectId,
        hash: &str,
        port: u16,
    ) -> Result<PathBuf, WorkspaceError> {
        let dir = self.production_dir(id, hash);
        let src = dir.join("src");
        fs::create_dir_all(&src).await.map_err(io_err(&src))?;

        for (rel, bytes) in collect_files(&self.app_dir(id)).await? {
            let target = src.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
            write(&target, &bytes).await?;
        }

        let dockerfile = src.join("Dockerfile");
        if !fs::try_exists(&dockerfile).await.unwrap_or(false) {
            write(&dockerfile, self.default_dockerfile().as_bytes()).await?;
        }

        let compose = render(
            "production compose file",
            &self.production_compose(id, hash, port),
        )?;
        write(&dir.join(COMPOSE_FILE), compose.as_bytes()).await?;
        Ok(dir)
    }

    /// Hashes with a production directory on disk.
    pub async fn production_hashes(&self, id: &ProjectId) -> Result<Vec<String>, WorkspaceError> {
        let base = self.project_dir(id).join(PRODUCTION_DIR);
        let mut entries = match fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&base)(e)),
        };

        let mut hashes = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&base))? {
            if entry.file_type().await.map_err(io_err(&base))?.is_dir() {
                hashes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Delete the project directory. Missing is fine.
    #[instrument(skip(self), fields(project_id = %id), err)]
    pub async fn remove(&self, id: &ProjectId) -> Result<(), WorkspaceError> {
        let dir = self.project_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    fn dev_compose(&self, id: &ProjectId) -> serde_json::Value {
        let s = &self.settings;
        json!({
            "name": compose_project_name(id),
            "services": {
                "dev": {
                    "image": s.dev_image,
                    "working_dir": "/workspace/app",
                    "command": ["sleep", "infinity"],
                    "volumes": ["./app:/workspace/app"],
                    "networks": ["edge"],
                    "restart": "unless-stopped",
                },
                "agent": {
                    "image": s.agent_image,
                    "working_dir": "/workspace/app",
                    "command": ["serve", "--hostname", "0.0.0.0", "--port", AGENT_PORT.to_string()],
                    "volumes": ["./app:/workspace/app", "state:/root/.local/share/opencode"],
                    "networks": ["edge"],
                    "restart": "unless-stopped",
                    "healthcheck": {
                        "test": ["CMD-SHELL", format!("wget -q -O /dev/null http://localhost:{AGENT_PORT}/config || exit 1")],
                        "interval": "5s",
                        "timeout": "3s",
                        "retries": 20,
                    },
                },
            },
            "volumes": {
                "state": { "external": true, "name": volume_name(id) },
            },
            "networks": {
                "edge": { "external": true, "name": s.network },
            },
        })
    }

    fn production_compose(&self, id: &ProjectId, hash: &str, port: u16) -> serde_json::Value {
        json!({
            "name": production_project_name(id, hash),
            "services": {
                "app": {
                    "build": { "context": "./src" },
                    "environment": { "PORT": APP_PORT.to_string(), "NODE_ENV": "production" },
                    "ports": [format!("{port}:{APP_PORT}")],
                    "networks": ["edge"],
                    "restart": "unless-stopped",
                    "healthcheck": {
                        "test": ["CMD-SHELL", format!("wget -q -O /dev/null http://localhost:{APP_PORT}/ || exit 1")],
                        "interval": "5s",
                        "timeout": "3s",
                        "retries": 20,
                    },
                },
            },
            "networks": {
                "edge": { "external": true, "name": self.settings.network },
            },
        })
    }

    fn default_dockerfile(&self) -> String {
        format!(
            "FROM {image}\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN if [ -f package.json ]; then npm install && npm run build --if-present; fi\n\
             EXPOSE {APP_PORT}\n\
             CMD [\"npm\", \"start\"]\n",
            image = self.settings.dev_image
        )
    }
}

fn render(what: &'static str, value: &serde_json::Value) -> Result<String, WorkspaceError> {
    serde_yaml::to_string(value).map_err(|e| WorkspaceError::Render {
        what,
        message: e.to_string(),
    })
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), WorkspaceError> {
    fs::write(path, bytes).await.map_err(io_err(path))
}

/// Every file under `dir` as (`/`-separated relative path, contents), skipping
/// dependency and VCS directories. A missing directory has no files.
async fn collect_files(dir: &Path) -> Result<Vec<(String, Vec<u8>)>, WorkspaceError> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((path, prefix)) = pending.pop() {
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err(&path)(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&path))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = entry.file_type().await.map_err(io_err(&path))?;
            if file_type.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push((entry.path(), rel));
                }
            } else if file_type.is_file() {
                let entry_path = entry.path();
                let bytes = fs::read(&entry_path).await.map_err(io_err(&entry_path))?;
                files.push((rel, bytes));
            }
        }
    }
    Ok(files)
}
