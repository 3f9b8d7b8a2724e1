use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: String,
    pub modified: String,
}

impl From<SqliteRow> for Namespace {
    fn from(row: SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            created: row.get("created"),
            modified: row.get("modified"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub modified: String,
}

/// Return all namespaces; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
) -> Result<Vec<Namespace>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT id, name, description, created, modified
FROM namespaces
ORDER BY id
LIMIT ?
OFFSET ?;"#;

    sqlx::query(query)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(Namespace::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    namespace: &Namespace,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO namespaces (id, name, description, created, modified)
VALUES (?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&namespace.id)
        .bind(&namespace.name)
        .bind(&namespace.description)
        .bind(&namespace.created)
        .bind(&namespace.modified)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Namespace, StorageError> {
    let query = r#"
SELECT id, name, description, created, modified
FROM namespaces
WHERE id = ?;"#;

    sqlx::query(query)
        .bind(id)
        .map(Namespace::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE namespaces SET ");
    let mut separated = update_query.separated(", ");

    if let Some(name) = fields.name {
        separated.push("name = ");
        separated.push_bind_unseparated(name);
    }

    if let Some(description) = fields.description {
        separated.push("description = ");
        separated.push_bind_unseparated(description);
    }

    separated.push("modified = ");
    separated.push_bind_unseparated(fields.modified);

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
DELETE FROM namespaces
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
    use sqlx::Acquire;

    async fn setup() -> TestHarness {
        let harness = TestHarness::new().await;
        let mut conn = harness.conn().await.unwrap();

        let namespace = Namespace {
            id: "some_id".into(),
            name: "some_name".into(),
            description: "some_description".into(),
            created: "0".into(),
            modified: "0".into(),
        };

        insert(&mut conn, &namespace).await.unwrap();

        harness
    }

    #[tokio::test]
    async fn crud() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let namespace = get(&mut conn, "some_id").await.unwrap();
        assert_eq!(namespace.name, "some_name");

        let namespaces = list(&mut conn, 0, 10).await.unwrap();
        assert_eq!(namespaces.len(), 1);

        update(
            &mut conn,
            "some_id",
            UpdatableFields {
                name: Some("updated_name".into()),
                description: None,
                modified: "1".into(),
            },
        )
        .await
        .unwrap();

        let namespace = get(&mut conn, "some_id").await.unwrap();
        assert_eq!(namespace.name, "updated_name");
        assert_eq!(namespace.description, "some_description");

        delete(&mut conn, "some_id").await.unwrap();

        let result = get(&mut conn, "some_id").await.unwrap_err();
        assert_eq!(result, StorageError::NotFound);
    }

    #[tokio::test]
    async fn insert_duplicate_returns_exists() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let namespace = Namespace {
            id: "some_id".into(),
            ..Default::default()
        };

        let result = insert(&mut conn, &namespace).await.unwrap_err();
        assert_eq!(result, StorageError::Exists);
    }

    #[tokio::test]
    async fn uncommitted_transactions_roll_back() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        {
            let mut tx = conn.begin().await.unwrap();

            let namespace = Namespace {
                id: "tx_id".into(),
                ..Default::default()
            };

            insert(&mut tx, &namespace).await.unwrap();
            // tx dropped without commit.
        }

        let result = get(&mut conn, "tx_id").await.unwrap_err();
        assert_eq!(result, StorageError::NotFound);
    }
}
