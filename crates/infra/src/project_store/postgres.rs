//! Postgres-backed project store.
//!
//! Status changes lock the row (`SELECT ... FOR UPDATE`) and apply the
//! transition rules of [`Project::transition`] before writing, so concurrent
//! pipeline jobs cannot move a deleting project back to life.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use sandcastle_core::{ProjectId, UserId};
use sandcastle_projects::{ProductionDeployment, Project, ProjectStatus};

use super::{ProjectStore, ProjectStoreError};

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        owner_user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        prompt TEXT NOT NULL,
        model TEXT NOT NULL,
        images JSONB NOT NULL DEFAULT '[]'::jsonb,
        status TEXT NOT NULL,
        session_id TEXT,
        last_error TEXT,
        production JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS projects_owner_idx ON projects (owner_user_id, created_at)",
];

const PROJECT_COLUMNS: &str = "id, owner_user_id, name, prompt, model, images, status, \
     session_id, last_error, production, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresProjectStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), ProjectStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Lock the row, let `f` change it and write it back.
    async fn modify(
        &self,
        operation: &str,
        id: &ProjectId,
        f: impl FnOnce(&mut Project) -> Result<(), ProjectStoreError> + Send,
    ) -> Result<Project, ProjectStoreError> {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or_else(|| ProjectStoreError::NotFound(id.clone()))?;

        let mut project = decode_project(&row)?;
        f(&mut project)?;
        project.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE projects
               SET status = $2, last_error = $3, session_id = $4, production = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(project.id.as_str())
        .bind(project.status.as_str())
        .bind(project.last_error.as_deref())
        .bind(project.session_id.as_deref())
        .bind(production_json(&project)?)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(project)
    }
}

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    #[instrument(skip(self, project), fields(project_id = %project.id), err)]
    async fn upsert(&self, project: &Project) -> Result<(), ProjectStoreError> {
        let images = serde_json::to_value(&project.images)
            .map_err(|e| ProjectStoreError::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, owner_user_id, name, prompt, model, images, status,
                                  session_id, last_error, production, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE
               SET owner_user_id = EXCLUDED.owner_user_id,
                   name = EXCLUDED.name,
                   prompt = EXCLUDED.prompt,
                   model = EXCLUDED.model,
                   images = EXCLUDED.images,
                   status = EXCLUDED.status,
                   session_id = EXCLUDED.session_id,
                   last_error = EXCLUDED.last_error,
                   production = EXCLUDED.production,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(project.id.as_str())
        .bind(project.owner.as_str())
        .bind(&project.name)
        .bind(&project.prompt)
        .bind(&project.model)
        .bind(images)
        .bind(project.status.as_str())
        .bind(project.session_id.as_deref())
        .bind(project.last_error.as_deref())
        .bind(production_json(project)?)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, ProjectStoreError> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_project(&r)).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<Project>, ProjectStoreError> {
        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_user_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_owner", e))?;
        rows.iter().map(decode_project).collect()
    }

    #[instrument(skip(self, error), fields(project_id = %id, status = %status), err)]
    async fn set_status(
        &self,
        id: &ProjectId,
        status: ProjectStatus,
        error: Option<String>,
    ) -> Result<Project, ProjectStoreError> {
        self.modify("set_status", id, move |p| Ok(p.transition(status, error)?))
            .await
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn set_session(
        &self,
        id: &ProjectId,
        session_id: Option<String>,
    ) -> Result<Project, ProjectStoreError> {
        self.modify("set_session", id, move |p| {
            p.session_id = session_id;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, production), fields(project_id = %id), err)]
    async fn set_production(
        &self,
        id: &ProjectId,
        production: Option<ProductionDeployment>,
    ) -> Result<Project, ProjectStoreError> {
        self.modify("set_production", id, move |p| {
            p.production = production;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn delete(&self, id: &ProjectId) -> Result<bool, ProjectStoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug)]
struct ProjectRow {
    id: String,
    owner_user_id: String,
    name: String,
    prompt: String,
    model: String,
    images: serde_json::Value,
    status: String,
    session_id: Option<String>,
    last_error: Option<String>,
    production: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProjectRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProjectRow {
            id: row.try_get("id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            name: row.try_get("name")?,
            prompt: row.try_get("prompt")?,
            model: row.try_get("model")?,
            images: row.try_get("images")?,
            status: row.try_get("status")?,
            session_id: row.try_get("session_id")?,
            last_error: row.try_get("last_error")?,
            production: row.try_get("production")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ProjectRow> for Project {
    type Error = ProjectStoreError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            ProjectStoreError::Storage(format!("project {}: bad {what}: {e}", row.id))
        };
        Ok(Project {
            id: ProjectId::parse(row.id.as_str()).map_err(|e| corrupt("id", &e))?,
            owner: UserId::parse(row.owner_user_id.as_str()).map_err(|e| corrupt("owner", &e))?,
            images: serde_json::from_value(row.images.clone()).map_err(|e| corrupt("images", &e))?,
            status: row.status.parse().map_err(|e| corrupt("status", &e))?,
            production: row
                .production
                .clone()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| corrupt("production", &e))?,
            name: row.name,
            prompt: row.prompt,
            model: row.model,
            session_id: row.session_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_project(row: &PgRow) -> Result<Project, ProjectStoreError> {
    ProjectRow::from_row(row)
        .map_err(|e| ProjectStoreError::Storage(format!("failed to decode project row: {e}")))?
        .try_into()
}

fn production_json(project: &Project) -> Result<Option<serde_json::Value>, ProjectStoreError> {
    project
        .production
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| ProjectStoreError::Storage(e.to_string()))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProjectStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => ProjectStoreError::Conflict(msg),
                _ => ProjectStoreError::Storage(msg),
            }
        }
        _ => ProjectStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_owner_index() {
        assert!(SCHEMA[0].contains("CREATE TABLE IF NOT EXISTS projects"));
        assert!(SCHEMA[1].contains("owner_user_id"));
    }

    #[test]
    fn production_round_trips_through_json() {
        let mut project = Project::new(
            ProjectId::parse("p1").unwrap(),
            UserId::parse("u1").unwrap(),
            "p1",
            "prompt",
            "a/b",
            vec![],
        );
        assert_eq!(production_json(&project).unwrap(), None);

        project.production = Some(ProductionDeployment::building("0123456789ab", 4100));
        let value = production_json(&project).unwrap().unwrap();
        assert_eq!(value["hash"], "0123456789ab");
        assert_eq!(value["status"], "building");
    }
}
