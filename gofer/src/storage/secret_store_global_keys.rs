use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretStoreGlobalKey {
    pub key: String,
    pub namespaces: String,
    pub created: String,
}

impl From<SqliteRow> for SecretStoreGlobalKey {
    fn from(row: SqliteRow) -> Self {
        Self {
            key: row.get("key"),
            namespaces: row.get("namespaces"),
            created: row.get("created"),
        }
    }
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<SecretStoreGlobalKey>, StorageError> {
    let query = r#"
SELECT key, namespaces, created
FROM secret_store_global_keys
ORDER BY key;"#;

    sqlx::query(query)
        .map(SecretStoreGlobalKey::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    secret_key: &SecretStoreGlobalKey,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO secret_store_global_keys (key, namespaces, created)
VALUES (?, ?, ?);"#;

    sqlx::query(query)
        .bind(&secret_key.key)
        .bind(&secret_key.namespaces)
        .bind(&secret_key.created)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<SecretStoreGlobalKey, StorageError> {
    let query = r#"
SELECT key, namespaces, created
FROM secret_store_global_keys
WHERE key = ?;"#;

    sqlx::query(query)
        .bind(key)
        .map(SecretStoreGlobalKey::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Replace the namespace filter list for an existing global secret key.
pub async fn update_namespaces(
    conn: &mut SqliteConnection,
    key: &str,
    namespaces: &str,
) -> Result<(), StorageError> {
    let query = r#"
UPDATE secret_store_global_keys
SET namespaces = ?
WHERE key = ?;"#;

    let result = sqlx::query(query)
        .bind(namespaces)
        .bind(key)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, key: &str) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM secret_store_global_keys
WHERE key = ?;"#;

    let result = sqlx::query(query)
        .bind(key)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
