use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{sqlite::SqliteRow, Execute, QueryBuilder, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskExecution {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub run_id: i64,
    pub task_id: String,
    pub task: String,
    pub created: String,
    pub started: String,
    pub ended: String,
    pub exit_code: Option<i64>,
    pub logs_expired: bool,
    pub logs_removed: bool,
    pub state: String,
    pub status: String,
    pub status_reason: String,
    pub variables: String,
}

impl From<SqliteRow> for TaskExecution {
    fn from(row: SqliteRow) -> Self {
        Self {
            namespace_id: row.get("namespace_id"),
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            task_id: row.get("task_id"),
            task: row.get("task"),
            created: row.get("created"),
            started: row.get("started"),
            ended: row.get("ended"),
            exit_code: row.get("exit_code"),
            logs_expired: row.get("logs_expired"),
            logs_removed: row.get("logs_removed"),
            state: row.get("state"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            variables: row.get("variables"),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdatableFields {
    pub started: Option<String>,
    pub ended: Option<String>,
    pub exit_code: Option<i64>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
    pub logs_expired: Option<bool>,
    pub logs_removed: Option<bool>,
    pub variables: Option<String>,
}

/// Return every task execution for a single run. Runs own a bounded set of executions (one per
/// configured task) so this endpoint does not page.
pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
) -> Result<Vec<TaskExecution>, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, run_id, task_id, task, created, started, ended, exit_code,
    logs_expired, logs_removed, state, status, status_reason, variables
FROM task_executions
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ?
ORDER BY task_id;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .map(TaskExecution::from)
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn insert(
    conn: &mut SqliteConnection,
    task_execution: &TaskExecution,
) -> Result<(), StorageError> {
    let query = r#"
INSERT INTO task_executions (namespace_id, pipeline_id, run_id, task_id, task, created, started,
    ended, exit_code, logs_expired, logs_removed, state, status, status_reason, variables)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#;

    sqlx::query(query)
        .bind(&task_execution.namespace_id)
        .bind(&task_execution.pipeline_id)
        .bind(task_execution.run_id)
        .bind(&task_execution.task_id)
        .bind(&task_execution.task)
        .bind(&task_execution.created)
        .bind(&task_execution.started)
        .bind(&task_execution.ended)
        .bind(task_execution.exit_code)
        .bind(task_execution.logs_expired)
        .bind(task_execution.logs_removed)
        .bind(&task_execution.state)
        .bind(&task_execution.status)
        .bind(&task_execution.status_reason)
        .bind(&task_execution.variables)
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
) -> Result<TaskExecution, StorageError> {
    let query = r#"
SELECT namespace_id, pipeline_id, run_id, task_id, task, created, started, ended, exit_code,
    logs_expired, logs_removed, state, status, status_reason, variables
FROM task_executions
WHERE namespace_id = ? AND pipeline_id = ? AND run_id = ? AND task_id = ?;"#;

    sqlx::query(query)
        .bind(namespace_id)
        .bind(pipeline_id)
        .bind(run_id)
        .bind(task_id)
        .map(TaskExecution::from)
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, query))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: i64,
    task_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE task_executions SET ");
    let mut separated = update_query.separated(", ");

    let mut updated_fields_total = 0;

    if let Some(started) = fields.started {
        separated.push("started = ");
        separated.push_bind_unseparated(started);
        updated_fields_total += 1;
    }

    if let Some(ended) = fields.ended {
        separated.push("ended = ");
        separated.push_bind_unseparated(ended);
        updated_fields_total += 1;
    }

    if let Some(exit_code) = fields.exit_code {
        separated.push("exit_code = ");
        separated.push_bind_unseparated(exit_code);
        updated_fields_total += 1;
    }

    if let Some(state) = fields.state {
        separated.push("state = ");
        separated.push_bind_unseparated(state);
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

    if let Some(logs_expired) = fields.logs_expired {
        separated.push("logs_expired = ");
        separated.push_bind_unseparated(logs_expired);
        updated_fields_total += 1;
    }

    if let Some(logs_removed) = fields.logs_removed {
        separated.push("logs_removed = ");
        separated.push_bind_unseparated(logs_removed);
        updated_fields_total += 1;
    }

    if let Some(variables) = fields.variables {
        separated.push("variables = ");
        separated.push_bind_unseparated(variables);
        updated_fields_total += 1;
    }

    if updated_fields_total == 0 {
        return Ok(());
    }

    update_query.push(" WHERE namespace_id = ");
    update_query.push_bind(namespace_id);
    update_query.push(" AND pipeline_id = ");
    update_query.push_bind(pipeline_id);
    update_query.push(" AND run_id = ");
    update_query.push_bind(run_id);
    update_query.push(" AND task_id = ");
    update_query.push_bind(task_id);
    update_query.push(";");

    let update_query = update_query.build();
    let sql = update_query.sql().to_string();

    update_query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, &sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{namespaces, pipeline_metadata, runs, tests::TestHarness};

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

        runs::insert(
            &mut conn,
            &runs::Run {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                pipeline_config_version: 1,
                started: "0".into(),
                ended: "0".into(),
                state: "pending".into(),
                status: "unknown".into(),
                initiator: "{}".into(),
                variables: "[]".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        insert(
            &mut conn,
            &TaskExecution {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                run_id: 1,
                task_id: "task_one".into(),
                task: "{}".into(),
                created: "0".into(),
                started: "0".into(),
                ended: "0".into(),
                exit_code: None,
                state: "processing".into(),
                status: "unknown".into(),
                variables: "[]".into(),
                ..Default::default()
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

        let execution = get(&mut conn, "default", "simple", 1, "task_one")
            .await
            .unwrap();
        assert_eq!(execution.state, "processing");
        assert_eq!(execution.exit_code, None);

        update(
            &mut conn,
            "default",
            "simple",
            1,
            "task_one",
            UpdatableFields {
                state: Some("complete".into()),
                status: Some("successful".into()),
                exit_code: Some(0),
                ended: Some("50".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let execution = get(&mut conn, "default", "simple", 1, "task_one")
            .await
            .unwrap();
        assert_eq!(execution.status, "successful");
        assert_eq!(execution.exit_code, Some(0));

        let executions = list(&mut conn, "default", "simple", 1).await.unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_task_id_within_run_rejected() {
        let harness = setup().await;
        let mut conn = harness.conn().await.unwrap();

        let result = insert(
            &mut conn,
            &TaskExecution {
                namespace_id: "default".into(),
                pipeline_id: "simple".into(),
                run_id: 1,
                task_id: "task_one".into(),
                task: "{}".into(),
                created: "0".into(),
                started: "0".into(),
                ended: "0".into(),
                state: "processing".into(),
                status: "unknown".into(),
                variables: "[]".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert_eq!(result, StorageError::Exists);
    }
}
