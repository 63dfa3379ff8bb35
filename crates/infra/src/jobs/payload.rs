//! Typed payloads, one per job type.
//!
//! Payloads are camelCase JSON and reject unknown fields. They are validated
//! before a row is inserted and again when a handler decodes them, so a row
//! edited by hand cannot smuggle bad input into a handler.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use sandcastle_core::{DomainError, DomainResult, ProjectId, UserId};
use sandcastle_projects::validate;

use super::types::{Job, JobType};

/// A payload bound to exactly one job type.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const JOB_TYPE: JobType;

    /// Correlation key stored on the job row.
    fn project_id(&self) -> Option<&ProjectId>;

    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// Decode and validate the payload of `job`.
pub fn decode<P: JobPayload>(job: &Job) -> DomainResult<P> {
    if job.job_type != P::JOB_TYPE.as_str() {
        return Err(DomainError::validation(format!(
            "job {} has type {}, expected {}",
            job.id,
            job.job_type,
            P::JOB_TYPE
        )));
    }
    let payload: P = serde_json::from_value(job.payload.clone()).map_err(|e| {
        DomainError::validation(format!("invalid {} payload: {e}", P::JOB_TYPE))
    })?;
    payload.validate()?;
    Ok(payload)
}

macro_rules! project_payload {
    ($(#[$meta:meta])* $name:ident => $job_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase", deny_unknown_fields)]
        pub struct $name {
            pub project_id: ProjectId,
        }

        impl $name {
            pub fn new(project_id: ProjectId) -> Self {
                Self { project_id }
            }
        }

        impl JobPayload for $name {
            const JOB_TYPE: JobType = $job_type;

            fn project_id(&self) -> Option<&ProjectId> {
                Some(&self.project_id)
            }
        }
    };
}

project_payload!(
    /// Start the development container group.
    DockerComposeUp => JobType::DockerComposeUp
);
project_payload!(
    /// Create the agent session once containers are healthy.
    OpencodeSessionCreate => JobType::OpencodeSessionCreate
);
project_payload!(
    /// Stop the development container group (volumes are kept).
    DockerStop => JobType::DockerStop
);
project_payload!(
    /// Tear a project down completely.
    ProjectDelete => JobType::ProjectDelete
);

/// `project.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectCreate {
    pub project_id: ProjectId,
    pub owner_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl JobPayload for ProjectCreate {
    const JOB_TYPE: JobType = JobType::ProjectCreate;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        if let Some(name) = &self.name {
            validate::name(name)?;
        }
        validate::prompt(&self.prompt)?;
        validate::model(&self.model)?;
        validate::images(&self.images)
    }
}

/// `docker.waitReady`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DockerWaitReady {
    pub project_id: ProjectId,
    /// Start of the readiness budget.
    pub started_at: DateTime<Utc>,
    /// How many times the stack was restarted after the budget ran out.
    #[serde(default)]
    pub reschedule_count: u32,
}

impl JobPayload for DockerWaitReady {
    const JOB_TYPE: JobType = JobType::DockerWaitReady;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }
}

/// `opencode.sendInitialPrompt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpencodeSendInitialPrompt {
    pub project_id: ProjectId,
    pub session_id: String,
}

impl JobPayload for OpencodeSendInitialPrompt {
    const JOB_TYPE: JobType = JobType::OpencodeSendInitialPrompt;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        validate::session_id(&self.session_id)
    }
}

/// `opencode.sendUserPrompt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpencodeSendUserPrompt {
    pub project_id: ProjectId,
    pub session_id: String,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl JobPayload for OpencodeSendUserPrompt {
    const JOB_TYPE: JobType = JobType::OpencodeSendUserPrompt;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        validate::session_id(&self.session_id)?;
        validate::prompt(&self.prompt)?;
        validate::model(&self.model)?;
        validate::images(&self.images)
    }
}

/// `production.build`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductionBuild {
    pub project_id: ProjectId,
    pub production_port: u16,
}

impl JobPayload for ProductionBuild {
    const JOB_TYPE: JobType = JobType::ProductionBuild;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        validate::production_port(self.production_port)
    }
}

/// `production.start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductionStart {
    pub project_id: ProjectId,
    pub production_port: u16,
    pub production_hash: String,
}

impl JobPayload for ProductionStart {
    const JOB_TYPE: JobType = JobType::ProductionStart;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        validate::production_port(self.production_port)?;
        validate::production_hash(&self.production_hash)
    }
}

/// `production.waitReady`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductionWaitReady {
    pub project_id: ProjectId,
    pub production_port: u16,
    pub production_hash: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub reschedule_count: u32,
}

impl JobPayload for ProductionWaitReady {
    const JOB_TYPE: JobType = JobType::ProductionWaitReady;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        validate::production_port(self.production_port)?;
        validate::production_hash(&self.production_hash)
    }
}

/// `production.stop`. Without a hash, the project's current deployment is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductionStop {
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_hash: Option<String>,
}

impl JobPayload for ProductionStop {
    const JOB_TYPE: JobType = JobType::ProductionStop;

    fn project_id(&self) -> Option<&ProjectId> {
        Some(&self.project_id)
    }

    fn validate(&self) -> DomainResult<()> {
        match &self.production_hash {
            Some(hash) => validate::production_hash(hash),
            None => Ok(()),
        }
    }
}

/// `projects.deleteAllForUser`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectsDeleteAllForUser {
    pub owner_user_id: UserId,
}

impl JobPayload for ProjectsDeleteAllForUser {
    const JOB_TYPE: JobType = JobType::ProjectsDeleteAllForUser;

    fn project_id(&self) -> Option<&ProjectId> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payloads_use_camel_case_wire_names() {
        let payload = DockerWaitReady {
            project_id: ProjectId::parse("p1").unwrap(),
            started_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            reschedule_count: 1,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["rescheduleCount"], 1);
        assert!(value.get("startedAt").is_some());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<DockerStop>(json!({"projectId": "p1", "force": true}));
        assert!(err.is_err());
    }

    #[test]
    fn bad_ids_are_rejected_during_deserialization() {
        let err = serde_json::from_value::<DockerStop>(json!({"projectId": "../../etc"}));
        assert!(err.is_err());
    }

    #[test]
    fn project_create_validation() {
        let mut payload: ProjectCreate = serde_json::from_value(json!({
            "projectId": "p1",
            "ownerUserId": "u1",
            "prompt": "build a landing page",
            "model": "anthropic/claude-sonnet-4"
        }))
        .unwrap();
        assert!(payload.images.is_empty());
        assert!(payload.validate().is_ok());

        payload.model = "sonnet".to_string();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn production_payloads_require_valid_hash_and_port() {
        let ok = ProductionStart {
            project_id: ProjectId::parse("p1").unwrap(),
            production_port: 4100,
            production_hash: "0123456789ab".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad_port = ProductionStart {
            production_port: 22,
            ..ok.clone()
        };
        assert!(bad_port.validate().is_err());

        let bad_hash = ProductionStop {
            project_id: ProjectId::parse("p1").unwrap(),
            production_hash: Some("HEAD".to_string()),
        };
        assert!(bad_hash.validate().is_err());
    }
}
