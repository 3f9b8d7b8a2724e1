use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub id: String,
    pub hash: String,
    pub created: String,
    pub kind: String,
    pub namespaces: String,
    pub metadata: String,
    pub expires: String,
    pub disabled: bool,
}

impl From<SqliteRow> for Token {
    fn from(row: SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            hash: row.get("hash"),
            created: row.get("created"),
            kind: row.get("kind"),
            namespaces: row.get("namespaces"),
            metadata: row.get("metadata"),
            expires: row.get("expires"),
            disabled: row.get("disabled"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub disabled: Option<bool>,
}

/// Return all tokens; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
) -> Result<Vec<Token>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT id, hash, created, kind, namespaces, metadata, expires, disabled
FROM tokens
ORDER BY id
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(Token::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(conn: &mut SqliteConnection, token: &Token) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO tokens (id, hash, created, kind, namespaces, metadata, expires, disabled)
VALUES (?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&token.id)
        .bind(&token.hash)
        .bind(&token.created)
        .bind(&token.kind)
        .bind(&token.namespaces)
        .bind(&token.metadata)
        .bind(&token.expires)
        .bind(token.disabled)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Token, StorageError> {
    let query = r#"
SELECT id, hash, created, kind, namespaces, metadata, expires, disabled
FROM tokens
WHERE id = ?;"#;

    sqlx::query(query)
        .bind(id)
        .map(Token::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

/// Credential validation path; the caller hashes the presented token and looks the hash up here.
pub async fn get_by_hash(conn: &mut SqliteConnection, hash: &str) -> Result<Token, StorageError> {
    let query = r#"
SELECT id, hash, created, kind, namespaces, metadata, expires, disabled
FROM tokens
WHERE hash = ?;"#;

    sqlx::query(query)
        .bind(hash)
        .map(Token::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tokens SET ");
    let mut separated = update_query.separated(", ");

    let mut updated_fields_total = 0;

    if let Some(disabled) = fields.disabled {
        separated.push("disabled = ");
        separated.push_bind_unseparated(disabled);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE id = ");
    update_query.push_bind(id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM tokens
WHERE id = ?;"#;

    let result = sqlx::query(query)
        .bind(id)
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
    use crate::storage::tests::TestHarness;

    #[tokio::test]
    async fn crud_and_hash_lookup() {
        let harness = TestHarness::new().await;
        let mut conn = harness.conn().await.unwrap();

        let token = Token {
            id: "token_one".into(),
            hash: "somehash".into(),
            created: "0".into(),
            kind: "client".into(),
            namespaces: "[\"default\"]".into(),
            metadata: "{}".into(),
            expires: "0".into(),
            disabled: false,
        };

        insert(&mut conn, &token).await.unwrap();

        let fetched = get_by_hash(&mut conn, "somehash").await.unwrap();
        assert_eq!(fetched.id, "token_one");

        update(
            &mut conn,
            "token_one",
            UpdatableFields {
                disabled: Some(true),
            },
        )
        .await
        .unwrap();

        let fetched = get(&mut conn, "token_one").await.unwrap();
        assert!(fetched.disabled);

        delete(&mut conn, "token_one").await.unwrap();
        assert_eq!(
            get(&mut conn, "token_one").await.unwrap_err(),
            StorageError::NotFound
        );
    }
}
