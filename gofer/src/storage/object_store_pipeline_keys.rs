use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStorePipelineKey {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub key: String,
    pub created: String,
}

impl From<SqliteRow> for ObjectStorePipelineKey {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            key: row.get("key"),
            created: row.get("created"),
        }
    }
}

/// Return all object keys for a pipeline, oldest first. The insertion-order listing is what the
/// object ring buffer eviction walks.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<ObjectStorePipelineKey>, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, key, created
FROM object_store_pipeline_keys
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY created ASC, key ASC;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(ObjectStorePipelineKey::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    object_key: &ObjectStorePipelineKey,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO object_store_pipeline_keys (namespace_id, pipeline_id, key, created)
VALUES (?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&object_key.namespace_id)
        .bind(&object_key.pipeline_id)
        .bind(&object_key.key)
        .bind(&object_key.created)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    key: &str,
) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM object_store_pipeline_keys
WHERE namespace_id = ? AND pipeline_id = ? AND key = ?;"#;

    let result = sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(key)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
