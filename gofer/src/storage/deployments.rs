use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub deployment_id: i64,
    pub start_version: i64,
    pub end_version: i64,
    pub started: String,
    pub ended: String,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub logs: String,
}

impl From<SqliteRow> for Deployment {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            deployment_id: row.get("deployment_id"),
            start_version: row.get("start_version"),
            end_version: row.get("end_version"),
            started: row.get("started"),
            ended: row.get("ended"),
            state: row.get("state"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            logs: row.get("logs"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub ended: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub logs: Option<String>,
}

/// Return all deployments for a pipeline, newest first; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    offset: u64,
    limit: u64,
) -> Result<Vec<Deployment>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT namespace_id, pipeline_id, deployment_id, start_version, end_version, started, ended,
    state, status, status_reason, logs
FROM deployments
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY deployment_id DESC
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(Deployment::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Insert a new deployment. The deployment id is expected to have been allocated by the caller
/// via [`get_latest`] inside the same transaction that performs this insert.
pub async fn insert(
    conn: &mut SqliteConnection,
    deployment: &Deployment,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO deployments (namespace_id, pipeline_id, deployment_id, start_version, end_version,
    started, ended, state, status, status_reason, logs)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&deployment.namespace_id)
        .bind(&deployment.pipeline_id)
        .bind(deployment.deployment_id)
        .bind(deployment.start_version)
        .bind(deployment.end_version)
        .bind(&deployment.started)
        .bind(&deployment.ended)
        .bind(&deployment.state)
        .bind(&deployment.status)
        .bind(&deployment.status_reason)
        .bind(&deployment.logs)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    deployment_id: i64,
) -> Result<Deployment, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, deployment_id, start_version, end_version, started, ended,
    state, status, status_reason, logs
FROM deployments
WHERE namespace_id = ? AND pipeline_id = ? AND deployment_id = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(deployment_id)
        .map(Deployment::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Deployment, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, deployment_id, start_version, end_version, started, ended,
    state, status, status_reason, logs
FROM deployments
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY deployment_id DESC
LIMIT 1;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(Deployment::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    deployment_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE deployments SET ");
    let mut separated = update_query.separated(", ");

    let mut updated_fields_total = 0;

    if let Some(ended) = fields.ended {
        separated.push("ended = ");
        separated.push_bind_unseparated(ended);
        updated_fields_total += 1;
    }

    if let Some(state) = fields.state {
        separated.push("state = ");
        separated.push_bind_unseparated(state);
        updated_fields_total += 1;
    }

    if let Some(status) = fields.status {
        separated.push("status = ");
        separated.push_bind_unseparated(status);
        updated_fields_total += 1;
    }

    if let Some(status_reason) = fields.status_reason {
        separated.push("status_reason = ");
        separated.push_bind_unseparated(status_reason);
        updated_fields_total += 1;
    }

    if let Some(logs) = fields.logs {
        separated.push("logs = ");
        separated.push_bind_unseparated(logs);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND deployment_id = ");
    update_query.push_bind(deployment_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}
