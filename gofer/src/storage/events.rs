use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub kind: String,
    pub details: String,
    pub emitted: String,
}

impl From<SqliteRow> for Event {
    fn from(row: SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            kind: row.get("kind"),
            details: row.get("details"),
            emitted: row.get("emitted"),
        }
    }
}

/// Return all events in id order; limited to 200 rows in any one response.
/// The reverse parameter sorts events in reverse id order (newest event first).
pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = r#"
SELECT id, kind, details, emitted
FROM events
ORDER BY id ASC
LIMIT ?
OFFSET ?;"#;

    let query = if reverse {
        query.replacen("ASC", "DESC", 1)
    } else {
        query.to_string()
    };

    sqlx::query(&query)
        .bind(limit as i64)
        .bind(offset as i64)
        .map(Event::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, &query))
        .await
}

/// Insert a new event; the monotonic id is assigned by the database and returned to the caller.
pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<i64, StorageError> {
    let query = r#"
INSERT INTO events (kind, details, emitted)
VALUES (?, ?, ?);"#;

    let result = sqlx::query(query)
        .bind(&event.kind)
        .bind(&event.details)
        .bind(&event.emitted)
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Event, StorageError> {
    let query = r#"
SELECT id, kind, details, emitted
FROM events
WHERE id = ?;"#;

    sqlx::query(query)
        .bind(id)
        .map(Event::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<(), StorageError> {
    let query = r#"
DELETE FROM events
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
    async fn ids_are_monotonic_even_across_deletes() {
        let harness = TestHarness::new().await;
        let mut conn = harness.conn().await.unwrap();

        let event = Event {
            id: 0,
            kind: "run_started".into(),
            details: "{}".into(),
            emitted: "0".into(),
        };

        let first = insert(&mut conn, &event).await.unwrap();
        let second = insert(&mut conn, &event).await.unwrap();
        assert!(second > first);

        delete(&mut conn, second).await.unwrap();

        let third = insert(&mut conn, &event).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test]
    async fn list_reverse_returns_newest_first() {
        let harness = TestHarness::new().await;
        let mut conn = harness.conn().await.unwrap();

        for _ in 0..3 {
            insert(
                &mut conn,
                &Event {
                    id: 0,
                    kind: "run_started".into(),
                    details: "{}".into(),
                    emitted: "0".into(),
                },
            )
            .await
            .unwrap();
        }

        let events = list(&mut conn, 0, 0, true).await.unwrap();
        assert_eq!(events.first().unwrap().id, 3);
        assert_eq!(events.last().unwrap().id, 1);
    }
}
