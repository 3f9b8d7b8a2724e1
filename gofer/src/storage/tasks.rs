use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

/// Tasks belong to a single pipeline config version; the `task` column holds the full serialized
/// task definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub pipeline_config_version: i64,
    pub task_id: String,
    pub task: String,
}

impl From<SqliteRow> for Task {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            pipeline_config_version: row.get("pipeline_config_version"),
            task_id: row.get("task_id"),
            task: row.get("task"),
        }
    }
}

/// Return every task for a single pipeline config version. Configs are bounded well below the
/// row limit so this endpoint does not page.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    version: i64,
) -> Result<Vec<Task>, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, task
FROM tasks
WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ?
ORDER BY task_id;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .map(Task::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(conn: &mut SqliteConnection, task: &Task) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO tasks (namespace_id, pipeline_id, pipeline_config_version, task_id, task)
VALUES (?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&task.namespace_id)
        .bind(&task.pipeline_id)
        .bind(task.pipeline_config_version)
        .bind(&task.task_id)
        .bind(&task.task)
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
    task_id: &str,
) -> Result<Task, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, pipeline_config_version, task_id, task
FROM tasks
WHERE namespace_id = ? AND pipeline_id = ? AND pipeline_config_version = ? AND task_id = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(version)
        .bind(task_id)
        .map(Task::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}
