use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Acquire, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Run {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: i64,
    pub pipeline_config_version: i64,
    pub started: String,
    pub ended: String,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub initiator: String,
    pub variables: String,
    pub token_id: Option<String>,
    pub store_objects_expired: bool,
}

impl From<SqliteRow> for Run {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            pipeline_config_version: row.get("pipeline_config_version"),
            started: row.get("started"),
            ended: row.get("ended"),
            state: row.get("state"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            initiator: row.get("initiator"),
            variables: row.get("variables"),
            token_id: row.get("token_id"),
            store_objects_expired: row.get("store_objects_expired"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub ended: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub variables: Option<String>,
    pub store_objects_expired: Option<bool>,
}

/// Return runs for a given namespace/pipeline, newest run first; limited to 200 rows per
/// response.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    offset: u64,
    limit: u64,
) -> Result<Vec<Run>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT namespace_id, pipeline_id, run_id, pipeline_config_version, started, ended, state, status,
    status_reason, initiator, variables, token_id, store_objects_expired
FROM runs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY run_id DESC
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(Run::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Insert a new run, allocating the next sequential run id for the pipeline. The read of the
/// previous high-water mark and the insert happen inside a single transaction so that two
/// concurrent starts can never mint the same id. Returns the assigned id.
pub async fn insert(conn: &mut SqliteConnection, run: &Run) -> Result<i64, StorageError> {
    let mut tx = conn
        .begin()
        .map_err(|e| map_sqlx_error(e, "begin transaction"))
        .await?;

    let last_run = list(&mut tx, &run.namespace_id, &run.pipeline_id, 0, 1).await?;

    let next_id = match last_run.first() {
        Some(run) => run.run_id + 1,
        None => 1,
    };

    let query = r#"
INSERT INTO runs (namespace_id, pipeline_id, run_id, pipeline_config_version, started, ended,
    state, status, status_reason, initiator, variables, token_id, store_objects_expired)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&run.namespace_id)
        .bind(&run.pipeline_id)
        .bind(next_id)
        .bind(run.pipeline_config_version)
        .bind(&run.started)
        .bind(&run.ended)
        .bind(&run.state)
        .bind(&run.status)
        .bind(&run.status_reason)
        .bind(&run.initiator)
        .bind(&run.variables)
        .bind(&run.token_id)
        .bind(run.store_objects_expired)
        .execute(&mut *tx)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    tx.commit()
        .map_err(|e| map_sqlx_error(e, "commit transaction"))
        .await?;

    Ok(next_id)
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Run, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, run_id, pipeline_config_version, started, ended, state, status,
    status_reason, initiator, variables, token_id, store_objects_expired
FROM runs
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .map(Run::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Run, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, run_id, pipeline_config_version, started, ended, state, status,
    status_reason, initiator, variables, token_id, store_objects_expired
FROM runs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY run_id DESC
LIMIT 1;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(Run::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE runs SET ");
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

    if let Some(variables) = fields.variables {
        separated.push("variables = ");
        separated.push_bind_unseparated(variables);
        updated_fields_total += 1;
    }

    if let Some(store_objects_expired) = fields.store_objects_expired {
        separated.push("store_objects_expired = ");
        separated.push_bind_unseparated(store_objects_expired);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND run_id = ");
    update_query.push_bind(run_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_configs, pipeline_metadata, tests::TestHarness};

    async fn setup() -> TestHarness {
        let harness = TestHarness::new().await;
        let mut conn = harness.conn().await.unwrap();

        namespaces::insert(
            &mut conn,
            &namespaces::Namespace {
                id: "default".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        pipeline_metadata::insert(
            &mut conn,
            &pipeline_metadata::PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                state: "active".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        pipeline_configs::insert(
            &mut conn,
            &pipeline_configs::PipelineConfig {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                version: 1,
                subscriptions: "[]".into(),
                state: "live".into(),
                registered: "0".into(),
                deprecated: "0".into(),
            },
        )
        .await
        .unwrap();

        harness
    }

    fn test_run() -> Run {
        Run {
            namespace_id: "default".into(),
            pipeline_id: "simple".into(),
            run_id: 0,
            pipeline_config_version: 1,
            started: "0".into(),
            ended: "0".into(),
            state: "pending".into(),
            status: "unknown".into(),
            status_reason: "".into(),
            initiator: "{}".into(),
            variables: "[]".into(),
            token_id: None,
            store_objects_expired: false,
        }
    }

    #[tokio::test]
    async fn run_ids_are_monotonic_per_pipeline() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let first = insert(&mut conn, &test_run()).await.unwrap();
        let second = insert(&mut conn, &test_run()).await.unwrap();
        let third = insert(&mut conn, &test_run()).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 3);

        let latest = get_latest(&mut conn, "default", "simple").await.unwrap();
        assert_eq!(latest.run_id, 3);
    }

    #[tokio::test]
    async fn update_transitions_state() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let run_id = insert(&mut conn, &test_run()).await.unwrap();

        update(
            &mut conn,
            "default",
            "simple",
            run_id,
            UpdatableFields {
                state: Some("complete".into()),
                status: Some("successful".into()),
                ended: Some("100".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let run = get(&mut conn, "default", "simple", run_id).await.unwrap();
        assert_eq!(run.state, "complete");
        assert_eq!(run.status, "successful");
    }
}
