use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub version: i64,
    pub subscriptions: String,
    pub state: String,
    pub registered: String,
    pub deprecated: String,
}

impl From<SqliteRow> for PipelineConfig {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            version: row.get("version"),
            subscriptions: row.get("subscriptions"),
            state: row.get("state"),
            registered: row.get("registered"),
            deprecated: row.get("deprecated"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub state: Option<String>,
    pub deprecated: Option<String>,
}

/// Return all configs for a pipeline, newest version first; limited to 200 rows in any one
/// response.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    offset: u64,
    limit: u64,
) -> Result<Vec<PipelineConfig>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT namespace_id, pipeline_id, version, subscriptions, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY version DESC
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(PipelineConfig::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    config: &PipelineConfig,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO pipeline_configs (namespace_id, pipeline_id, version, subscriptions, state,
    registered, deprecated)
VALUES (?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&config.namespace_id)
        .bind(&config.pipeline_id)
        .bind(config.version)
        .bind(&config.subscriptions)
        .bind(&config.state)
        .bind(&config.registered)
        .bind(&config.deprecated)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<PipelineConfig, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, version, subscriptions, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ? AND version = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Get the config with the highest version number for a pipeline.
pub async fn get_latest(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, version, subscriptions, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY version DESC
LIMIT 1;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Get the config currently deployed for a pipeline. At most one config is ever live.
pub async fn get_live(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineConfig, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, version, subscriptions, state, registered, deprecated
FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ? AND state = 'live';"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineConfig::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pipeline_configs SET ");
    let mut separated = update_query.separated(", ");

    let mut updated_fields_total = 0;

    if let Some(state) = fields.state {
        separated.push("state = ");
        separated.push_bind_unseparated(state);
        updated_fields_total += 1;
    }

    if let Some(deprecated) = fields.deprecated {
        separated.push("deprecated = ");
        separated.push_bind_unseparated(deprecated);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND version = ");
    update_query.push_bind(version);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM pipeline_configs
WHERE namespace_id = ? AND pipeline_id = ? AND version = ?;"#;

    let result = sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_metadata, tests::TestHarness};

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

        for version in 1..=3 {
            insert(
                &mut conn,
                &PipelineConfig {
                    namespace_id: "default".into(),
                    pipeline_id: "simple".into(),
                    version,
                    subscriptions: "[]".into(),
                    state: "unreleased".into(),
                    registered: "0".into(),
                    deprecated: "0".into(),
                },
            )
            .await
            .unwrap();
        }

        harness
    }

    #[tokio::test]
    async fn versions_are_append_only_and_latest_wins() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let latest = get_latest(&mut conn, "default", "simple").await.unwrap();
        assert_eq!(latest.version, 3);

        let configs = list(&mut conn, "default", "simple", 0, 0).await.unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs.first().unwrap().version, 3);
    }

    #[tokio::test]
    async fn live_lookup_follows_state_flip() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let result = get_live(&mut conn, "default", "simple").await.unwrap_err();
        assert_eq!(result, StorageError::NotFound);

        update(
            &mut conn,
            "default",
            "simple",
            2,
            UpdatableFields {
                state: Some("live".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let live = get_live(&mut conn, "default", "simple").await.unwrap();
        assert_eq!(live.version, 2);
    }
}
