//! `sandcastle-infra`: the durable job queue, its worker loop and the
//! project pipelines it runs, plus the adapters they talk to (Postgres,
//! docker compose, the coding agent and the workspace on disk).

pub mod agent;
pub mod config;
pub mod db;
pub mod jobs;
pub mod pipeline;
pub mod project_store;
pub mod runtime;
pub mod workspace;
