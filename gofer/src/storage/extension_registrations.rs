use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionRegistration {
    pub extension_id: String,
    pub image: String,
    pub registry_auth: String,
    pub settings: String,
    pub created: String,
    pub modified: String,
    pub status: String,
    pub key_id: String,
}

impl From<SqliteRow> for ExtensionRegistration {
    fn from(row: SqliteRow) -> Self {
        Self {
            extension_id: row.get("extension_id"),
            image: row.get("image"),
            registry_auth: row.get("registry_auth"),
            settings: row.get("settings"),
            created: row.get("created"),
            modified: row.get("modified"),
            status: row.get("status"),
            key_id: row.get("key_id"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub image: Option<String>,
    pub registry_auth: Option<String>,
    pub settings: Option<String>,
    pub status: Option<String>,
    pub key_id: Option<String>,
    pub modified: String,
}

/// Return all extension registrations; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
) -> Result<Vec<ExtensionRegistration>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT extension_id, image, registry_auth, settings, created, modified, status, key_id
FROM extension_registrations
ORDER BY extension_id
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(ExtensionRegistration::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    registration: &ExtensionRegistration,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO extension_registrations (extension_id, image, registry_auth, settings, created,
    modified, status, key_id)
VALUES (?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&registration.extension_id)
        .bind(&registration.image)
        .bind(&registration.registry_auth)
        .bind(&registration.settings)
        .bind(&registration.created)
        .bind(&registration.modified)
        .bind(&registration.status)
        .bind(&registration.key_id)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    extension_id: &str,
) -> Result<ExtensionRegistration, StorageError> {
    let query = r#"
SELECT extension_id, image, registry_auth, settings, created, modified, status, key_id
FROM extension_registrations
WHERE extension_id = ?;"#;

    sqlx::query(query)
        .bind(extension_id)
        .map(ExtensionRegistration::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    extension_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE extension_registrations SET ");
    let mut separated = update_query.separated(", ");

    if let Some(image) = fields.image {
        separated.push("image = ");
        separated.push_bind_unseparated(image);
    }

    if let Some(registry_auth) = fields.registry_auth {
        separated.push("registry_auth = ");
        separated.push_bind_unseparated(registry_auth);
    }

    if let Some(settings) = fields.settings {
        separated.push("settings = ");
        separated.push_bind_unseparated(settings);
    }

    if let Some(status) = fields.status {
        separated.push("status = ");
        separated.push_bind_unseparated(status);
    }

    if let Some(key_id) = fields.key_id {
        separated.push("key_id = ");
        separated.push_bind_unseparated(key_id);
    }

    separated.push("modified = ");
    separated.push_bind_unseparated(fields.modified);

    update_query.push(" WHERE extension_id = ");
    update_query.push_bind(extension_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, extension_id: &str) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM extension_registrations
WHERE extension_id = ?;"#;

    let result = sqlx::query(query)
        .bind(extension_id)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
