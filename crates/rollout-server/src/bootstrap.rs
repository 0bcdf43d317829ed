//! Cold-start bootstrap.
//!
//! A workspace without a usable snapshot is rebuilt from the database rows
//! of its entities. The loader yields `(kind, json)` rows; [`stores_from_rows`]
//! turns them into entity stores, and the engine derives everything else.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_core::{Entity, EntityKind};
use rollout_engine::{Store, Stores};
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, warn};

/// One entity row
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    /// Entity kind wire name, e.g. `deployment-version`
    pub kind: String,
    /// Entity as JSON
    pub data: Value,
}

/// Source of initial workspace state
#[async_trait]
pub trait InitialStateLoader: Send + Sync + Debug {
    /// Workspaces known to the database
    async fn workspace_ids(&self) -> ServerResult<Vec<String>>;

    /// Entity rows of one workspace
    async fn load(&self, workspace_id: &str) -> ServerResult<Vec<EntityRow>>;
}

/// Loader for deployments without a database
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInitialStateLoader;

#[async_trait]
impl InitialStateLoader for NoopInitialStateLoader {
    async fn workspace_ids(&self) -> ServerResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn load(&self, _workspace_id: &str) -> ServerResult<Vec<EntityRow>> {
        Ok(Vec::new())
    }
}

fn put<T: Entity>(store: &mut Store<T>, data: Value, stamp: DateTime<Utc>) -> ServerResult<()> {
    let entity: T = serde_json::from_value(data)
        .map_err(|e| ServerError::BootstrapError(format!("Invalid {} row: {}", T::KIND, e)))?;
    store.upsert(entity, stamp);
    Ok(())
}

/// Build entity stores from database rows.
///
/// Rows of unknown kinds are skipped with a warning; malformed rows fail the
/// whole load so a workspace is never started half populated.
pub fn stores_from_rows(rows: Vec<EntityRow>, stamp: DateTime<Utc>) -> ServerResult<Stores> {
    let mut stores = Stores::default();
    for row in rows {
        let EntityRow { kind, data } = row;
        match kind.as_str() {
            k if k == EntityKind::System.as_str() => put(&mut stores.systems, data, stamp)?,
            k if k == EntityKind::Deployment.as_str() => put(&mut stores.deployments, data, stamp)?,
            k if k == EntityKind::Environment.as_str() => put(&mut stores.environments, data, stamp)?,
            k if k == EntityKind::Resource.as_str() => put(&mut stores.resources, data, stamp)?,
            k if k == EntityKind::ResourceProvider.as_str() => put(&mut stores.resource_providers, data, stamp)?,
            k if k == EntityKind::DeploymentVersion.as_str() => put(&mut stores.deployment_versions, data, stamp)?,
            k if k == EntityKind::JobAgent.as_str() => put(&mut stores.job_agents, data, stamp)?,
            k if k == EntityKind::Policy.as_str() => put(&mut stores.policies, data, stamp)?,
            k if k == EntityKind::UserApprovalRecord.as_str() => put(&mut stores.user_approval_records, data, stamp)?,
            k if k == EntityKind::RelationshipRule.as_str() => put(&mut stores.relationship_rules, data, stamp)?,
            k if k == EntityKind::ResourceVariable.as_str() => put(&mut stores.resource_variables, data, stamp)?,
            k if k == EntityKind::Release.as_str() => put(&mut stores.releases, data, stamp)?,
            k if k == EntityKind::Job.as_str() => put(&mut stores.jobs, data, stamp)?,
            other => warn!(kind = %other, "Skipping row of unknown kind"),
        }
    }
    debug!(
        resources = stores.resources.len(),
        deployments = stores.deployments.len(),
        environments = stores.environments.len(),
        "Built stores from rows"
    );
    Ok(stores)
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresInitialStateLoader;

#[cfg(feature = "postgres")]
mod postgres {
    use super::{EntityRow, InitialStateLoader};
    use crate::error::{ServerError, ServerResult};
    use async_trait::async_trait;
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use sqlx::Row;
    use tracing::info;

    fn bootstrap_error(e: sqlx::Error) -> ServerError {
        ServerError::BootstrapError(e.to_string())
    }

    /// Loads entity rows from the `workspace_entity` view
    /// (`workspace_id`, `kind`, `data jsonb`)
    #[derive(Debug, Clone)]
    pub struct PostgresInitialStateLoader {
        pool: PgPool,
    }

    impl PostgresInitialStateLoader {
        /// Connect to the database
        pub async fn connect(database_url: &str) -> ServerResult<Self> {
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect(database_url)
                .await
                .map_err(bootstrap_error)?;
            info!("Connected bootstrap database");
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl InitialStateLoader for PostgresInitialStateLoader {
        async fn workspace_ids(&self) -> ServerResult<Vec<String>> {
            let rows = sqlx::query("SELECT DISTINCT workspace_id FROM workspace_entity ORDER BY workspace_id")
                .fetch_all(&self.pool)
                .await
                .map_err(bootstrap_error)?;
            rows.iter()
                .map(|row| row.try_get::<String, _>("workspace_id").map_err(bootstrap_error))
                .collect()
        }

        async fn load(&self, workspace_id: &str) -> ServerResult<Vec<EntityRow>> {
            let rows = sqlx::query("SELECT kind, data FROM workspace_entity WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await
                .map_err(bootstrap_error)?;
            rows.iter()
                .map(|row| {
                    Ok(EntityRow {
                        kind: row.try_get("kind").map_err(bootstrap_error)?,
                        data: row.try_get("data").map_err(bootstrap_error)?,
                    })
                })
                .collect()
        }
    }
}
