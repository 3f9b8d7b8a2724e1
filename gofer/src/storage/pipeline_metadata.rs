use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetadata {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub name: String,
    pub description: String,
    pub parallelism: i64,
    pub state: String,
    pub created: String,
    pub modified: String,
}

impl From<SqliteRow> for PipelineMetadata {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            name: row.get("name"),
            description: row.get("description"),
            parallelism: row.get("parallelism"),
            state: row.get("state"),
            created: row.get("created"),
            modified: row.get("modified"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parallelism: Option<i64>,
    pub state: Option<String>,
    pub modified: String,
}

/// Return all pipelines for a namespace; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    offset: u64,
    limit: u64,
) -> Result<Vec<PipelineMetadata>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT namespace_id, pipeline_id, name, description, parallelism, state, created, modified
FROM pipeline_metadata
WHERE namespace_id = ?
ORDER BY pipeline_id
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(PipelineMetadata::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    pipeline: &PipelineMetadata,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO pipeline_metadata (namespace_id, pipeline_id, name, description, parallelism, state,
    created, modified)
VALUES (?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&pipeline.namespace_id)
        .bind(&pipeline.pipeline_id)
        .bind(&pipeline.name)
        .bind(&pipeline.description)
        .bind(pipeline.parallelism)
        .bind(&pipeline.state)
        .bind(&pipeline.created)
        .bind(&pipeline.modified)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<PipelineMetadata, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, name, description, parallelism, state, created, modified
FROM pipeline_metadata
WHERE namespace_id = ? AND pipeline_id = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(PipelineMetadata::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pipeline_metadata SET ");
    let mut separated = update_query.separated(", ");

    if let Some(name) = fields.name {
        separated.push("name = ");
        separated.push_bind_unseparated(name);
    }

    if let Some(description) = fields.description {
        separated.push("description = ");
        separated.push_bind_unseparated(description);
    }

    if let Some(parallelism) = fields.parallelism {
        separated.push("parallelism = ");
        separated.push_bind_unseparated(parallelism);
    }

    if let Some(state) = fields.state {
        separated.push("state = ");
        separated.push_bind_unseparated(state);
    }

    separated.push("modified = ");
    separated.push_bind_unseparated(fields.modified);

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
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
) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM pipeline_metadata
WHERE namespace_id = ? AND pipeline_id = ?;"#;

    let result = sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
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
    use crate::storage::{namespaces, tests::TestHarness};

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

        insert(
            &mut conn,
            &PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                name: "Simple".into(),
                description: "A simple pipeline".into(),
                parallelism: 0,
                state: "active".into(),
                created: "0".into(),
                modified: "0".into(),
            },
        )
        .await
        .unwrap();

        harness
    }

    #[tokio::test]
    async fn crud() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let pipeline = get(&mut conn, "default", "simple").await.unwrap();
        assert_eq!(pipeline.state, "active");

        update(
            &mut conn,
            "default",
            "simple",
            UpdatableFields {
                state: Some("disabled".into()),
                modified: "1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let pipeline = get(&mut conn, "default", "simple").await.unwrap();
        assert_eq!(pipeline.state, "disabled");

        delete(&mut conn, "default", "simple").await.unwrap();
        let result = get(&mut conn, "default", "simple").await.unwrap_err();
        assert_eq!(result, StorageError::NotFound);
    }

    #[tokio::test]
    async fn unknown_namespace_fails_foreign_key() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let result = insert(
            &mut conn,
            &PipelineMetadata {
                namespace_id: "missing".into(),
                pipeline_id: "simple".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert_ne!(result, StorageError::Exists);
    }
}
