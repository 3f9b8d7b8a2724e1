use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSubscription {
    pub extension_id: String,
    pub namespace_id: String,
    pub pipeline_id: String,
    pub extension_label: String,
    pub settings: String,
    pub status: String,
    pub status_reason: String,
}

impl From<SqliteRow> for ExtensionSubscription {
    fn from(row: SqliteRow) -> Self {
        Self {
            extension_id: row.get("extension_id"),
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            extension_label: row.get("extension_label"),
            settings: row.get("settings"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub settings: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
}

/// Return all subscriptions routed to a single extension.
pub async fn list_by_extension(
    conn: &mut SqliteConnection,
    extension_id: &str,
) -> Result<Vec<ExtensionSubscription>, StorageError> {
    let query = r#"
SELECT extension_id, namespace_id, pipeline_id, extension_label, settings, status, status_reason
FROM extension_subscriptions
WHERE extension_id = ?
ORDER BY namespace_id, pipeline_id, extension_label;"#;

    sqlx::query(query)
        .bind(extension_id)
        .map(ExtensionSubscription::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Return all subscriptions a single pipeline holds.
pub async fn list_by_pipeline(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<ExtensionSubscription>, StorageError> {
    let query = r#"
SELECT extension_id, namespace_id, pipeline_id, extension_label, settings, status, status_reason
FROM extension_subscriptions
WHERE namespace_id = ? AND pipeline_id = ?
ORDER BY extension_id, extension_label;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .map(ExtensionSubscription::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    subscription: &ExtensionSubscription,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO extension_subscriptions (extension_id, namespace_id, pipeline_id, extension_label,
    settings, status, status_reason)
VALUES (?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&subscription.extension_id)
        .bind(&subscription.namespace_id)
        .bind(&subscription.pipeline_id)
        .bind(&subscription.extension_label)
        .bind(&subscription.settings)
        .bind(&subscription.status)
        .bind(&subscription.status_reason)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    extension_label: &str,
) -> Result<ExtensionSubscription, StorageError> {
    let query = r#"
SELECT extension_id, namespace_id, pipeline_id, extension_label, settings, status, status_reason
FROM extension_subscriptions
WHERE namespace_id = ? AND pipeline_id = ? AND extension_id = ? AND extension_label = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(extension_id)
        .bind(extension_label)
        .map(ExtensionSubscription::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    extension_label: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE extension_subscriptions SET ");
    let mut separated = update_query.separated(", ");

    let mut updated_fields_total = 0;

    if let Some(settings) = fields.settings {
        separated.push("settings = ");
        separated.push_bind_unseparated(settings);
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

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND extension_id = ");
    update_query.push_bind(extension_id);
    update_query.push(" AND extension_label = ");
    update_query.push_bind(extension_label);
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
    extension_id: &str,
    extension_label: &str,
) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM extension_subscriptions
WHERE namespace_id = ? AND pipeline_id = ? AND extension_id = ? AND extension_label = ?;"#;

    let result = sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(extension_id)
        .bind(extension_label)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
