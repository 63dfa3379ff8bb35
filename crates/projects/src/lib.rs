//! `sandcastle-projects`: the project (sandbox) domain model.
//!
//! Pure domain: lifecycle statuses, production deployments, compose naming
//! and input validation. Persistence and container control live in
//! `sandcastle-infra`.

pub mod naming;
pub mod project;
pub mod validate;

pub use naming::{compose_project_name, content_hash, production_project_name, volume_name};
pub use project::{ProductionDeployment, ProductionStatus, Project, ProjectStatus};
