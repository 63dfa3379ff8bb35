//! Process configuration from `SANDCASTLE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sandcastle_observability::LogFormat;

use crate::jobs::types::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::jobs::{JobExecutorConfig, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::pipeline::PipelineSettings;
use crate::workspace::WorkspaceSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SandcastleConfig {
    /// Postgres stores instead of in-memory ones.
    pub persistent: bool,
    pub database_url: Option<String>,
    /// Executors started by this process.
    pub workers: usize,
    /// Written to the queue settings at start-up when set.
    pub concurrency: Option<u32>,
    pub max_attempts: u32,
    pub worker_prefix: String,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
    pub workspace_root: PathBuf,
    pub docker_bin: PathBuf,
    pub workspace: WorkspaceSettings,
    pub pipeline: PipelineSettings,
    pub log_format: LogFormat,
}

impl SandcastleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);

        let persistent = env.parse_or("SANDCASTLE_PERSISTENT", false)?;
        let database_url = env.get("DATABASE_URL");
        if persistent && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let workers: usize = env.parse_or("SANDCASTLE_WORKERS", 1)?;
        if workers == 0 {
            return Err(invalid("SANDCASTLE_WORKERS", "0", "at least one worker is required"));
        }

        let concurrency = match env.get("SANDCASTLE_CONCURRENCY") {
            Some(raw) => {
                let value: u32 = parse("SANDCASTLE_CONCURRENCY", &raw)?;
                if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
                    return Err(invalid(
                        "SANDCASTLE_CONCURRENCY",
                        &raw,
                        &format!("must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"),
                    ));
                }
                Some(value)
            }
            None => None,
        };

        let max_attempts: u32 = env.parse_or("SANDCASTLE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(invalid("SANDCASTLE_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let worker_prefix = env
            .get("SANDCASTLE_WORKER_PREFIX")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| "worker".to_string());

        let executor = JobExecutorConfig::default();
        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            env.millis_or("SANDCASTLE_RETRY_BASE_MS", retry_defaults.base_delay)?,
            env.millis_or("SANDCASTLE_RETRY_CAP_MS", retry_defaults.max_delay)?,
        );

        let workspace_defaults = WorkspaceSettings::default();
        let workspace = WorkspaceSettings {
            dev_image: env.string_or("SANDCASTLE_DEV_IMAGE", workspace_defaults.dev_image),
            agent_image: env.string_or("SANDCASTLE_AGENT_IMAGE", workspace_defaults.agent_image),
            network: env.string_or("SANDCASTLE_NETWORK", workspace_defaults.network),
        };

        let pipeline_defaults = PipelineSettings::default();
        let agent_endpoint_template = env.string_or(
            "SANDCASTLE_AGENT_URL_TEMPLATE",
            pipeline_defaults.agent_endpoint_template,
        );
        if !agent_endpoint_template.contains("{project}") {
            return Err(invalid(
                "SANDCASTLE_AGENT_URL_TEMPLATE",
                &agent_endpoint_template,
                "must contain {project}",
            ));
        }
        let pipeline = PipelineSettings {
            agent_endpoint_template,
            ready_poll: env.millis_or("SANDCASTLE_READY_POLL_MS", pipeline_defaults.ready_poll)?,
            ready_budget: env
                .millis_or("SANDCASTLE_READY_BUDGET_MS", pipeline_defaults.ready_budget)?,
            prompt_poll: env
                .millis_or("SANDCASTLE_PROMPT_POLL_MS", pipeline_defaults.prompt_poll)?,
            prompt_timeout: env
                .millis_or("SANDCASTLE_PROMPT_TIMEOUT_MS", pipeline_defaults.prompt_timeout)?,
            initial_prompt: env
                .string_or("SANDCASTLE_INITIAL_PROMPT", pipeline_defaults.initial_prompt),
        };

        Ok(Self {
            persistent,
            database_url,
            workers,
            concurrency,
            max_attempts,
            worker_prefix,
            poll_interval: env.millis_or("SANDCASTLE_POLL_MS", executor.poll_interval)?,
            lease: env.millis_or("SANDCASTLE_LEASE_MS", executor.lease)?,
            shutdown_grace: env
                .millis_or("SANDCASTLE_SHUTDOWN_GRACE_MS", executor.shutdown_grace)?,
            retry,
            workspace_root: PathBuf::from(env.string_or("SANDCASTLE_WORKSPACE_ROOT", "./data/projects")),
            docker_bin: PathBuf::from(env.string_or("SANDCASTLE_DOCKER_BIN", "docker")),
            workspace,
            pipeline,
            log_format: env.parse_or("SANDCASTLE_LOG_FORMAT", LogFormat::Json)?,
        })
    }

    /// Executor settings for the executor with `worker_id`.
    pub fn executor_config(&self, worker_id: impl Into<String>) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_worker_id(worker_id)
            .with_poll_interval(self.poll_interval)
            .with_lease(self.lease)
            .with_shutdown_grace(self.shutdown_grace)
            .with_retry(self.retry)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string_or(&self, key: &str, default: impl Into<String>) -> String {
        self.get(key).unwrap_or_else(|| default.into())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse(key, &raw),
            None => Ok(default),
        }
    }

    fn millis_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            Some(raw) => {
                let ms: u64 = parse(key, &raw)?;
                if ms == 0 {
                    return Err(invalid(key, &raw, "must be greater than zero"));
                }
                Ok(Duration::from_millis(ms))
            }
            None => Ok(default),
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, raw, &e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<SandcastleConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SandcastleConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert!(!cfg.persistent);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.concurrency, None);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.worker_prefix, "worker");
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.lease, Duration::from_secs(300));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.workspace_root, PathBuf::from("./data/projects"));
        assert_eq!(cfg.workspace.network, "sandcastle-edge");
        assert_eq!(cfg.pipeline.ready_budget, Duration::from_secs(180));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn persistent_requires_database_url() {
        assert_eq!(
            config(&[("SANDCASTLE_PERSISTENT", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
        let cfg = config(&[
            ("SANDCASTLE_PERSISTENT", "true"),
            ("DATABASE_URL", "postgres://localhost/sandcastle"),
        ])
        .unwrap();
        assert!(cfg.persistent);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("SANDCASTLE_WORKERS", "3"),
            ("SANDCASTLE_CONCURRENCY", "8"),
            ("SANDCASTLE_RETRY_BASE_MS", "500"),
            ("SANDCASTLE_RETRY_CAP_MS", "4000"),
            ("HOSTNAME", "box-7"),
            ("SANDCASTLE_LOG_FORMAT", "pretty"),
        ])
        .unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.concurrency, Some(8));
        assert_eq!(cfg.retry.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(cfg.retry.delay_for_attempt(10), Duration::from_secs(4));
        assert_eq!(cfg.worker_prefix, "box-7");
        assert_eq!(cfg.log_format, LogFormat::Pretty);

        let exec = cfg.executor_config("box-7-0-deadbeef");
        assert_eq!(exec.worker_id, "box-7-0-deadbeef");
        assert_eq!(exec.retry, cfg.retry);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config(&[("SANDCASTLE_CONCURRENCY", "21")]),
            Err(ConfigError::Invalid { key: "SANDCASTLE_CONCURRENCY", .. })
        ));
        assert!(matches!(
            config(&[("SANDCASTLE_POLL_MS", "soon")]),
            Err(ConfigError::Invalid { key: "SANDCASTLE_POLL_MS", .. })
        ));
        assert!(matches!(
            config(&[("SANDCASTLE_WORKERS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("SANDCASTLE_AGENT_URL_TEMPLATE", "http://agent:4096")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("SANDCASTLE_LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
