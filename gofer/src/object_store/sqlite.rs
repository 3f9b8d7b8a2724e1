use super::{ObjectStore, ObjectStoreError, Value};
use async_trait::async_trait;
use futures::TryFutureExt;
use serde::Deserialize;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pool: Pool<Sqlite>,
}

/// Sqlite Errors are determined by database error code. We map these to the specific code so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
fn map_sqlx_error(e: sqlx::Error, query: &str) -> ObjectStoreError {
    match e {
        sqlx::Error::RowNotFound => ObjectStoreError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => ObjectStoreError::Exists,
                    _ => ObjectStoreError::Internal(format!(
                        "Error occurred while running object store query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                ObjectStoreError::Internal(format!(
                    "Error occurred while running object store query; {database_err}; query: {query}"
                ))
            }
        }
        _ => ObjectStoreError::Internal(format!(
            "Error occurred while running object store query; {e:#?}; query: {query}"
        )),
    }
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| ObjectStoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_options)
            .await
            .map_err(|e| ObjectStoreError::Connection(e.to_string()))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| ObjectStoreError::Connection(e.to_string()))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS objects (
    key   TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key)
) STRICT;"#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(e, "create schema"))?;

        Ok(Engine { pool })
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>, ObjectStoreError> {
        self.pool.acquire().await.map_err(|e| {
            ObjectStoreError::Connection(format!(
                "Could not establish connection to object store; {e:?}"
            ))
        })
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn get(&self, key: &str) -> Result<Value, ObjectStoreError> {
        let mut conn = self.conn().await?;

        let query = "SELECT value FROM objects WHERE key = ?;";

        let row: (Vec<u8>,) = sqlx::query_as(query)
            .bind(key)
            .fetch_one(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        Ok(Value(row.0))
    }

    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), ObjectStoreError> {
        let mut conn = self.conn().await?;

        let query = if force {
            "INSERT INTO objects (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value;"
        } else {
            "INSERT INTO objects (key, value) VALUES (?, ?);"
        };

        sqlx::query(query)
            .bind(key)
            .bind(content)
            .execute(&mut *conn)
            .map_ok(|_| ())
            .map_err(|e| map_sqlx_error(e, query))
            .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut conn = self.conn().await?;

        let query = "SELECT key FROM objects WHERE key LIKE ? || '%' ORDER BY key;";

        let rows: Vec<(String,)> = sqlx::query_as(query)
            .bind(prefix)
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let mut conn = self.conn().await?;

        let query = "DELETE FROM objects WHERE key = ?;";

        let result = sqlx::query(query)
            .bind(key)
            .execute(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        if result.rows_affected() == 0 {
            return Err(ObjectStoreError::NotFound);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::ops::Deref;

    pub struct TestHarness {
        pub db: Engine,
        pub storage_path: String,
    }

    impl TestHarness {
        pub async fn new() -> Self {
            let mut rng = rand::thread_rng();
            let append_num: u32 = rng.gen();
            let storage_path = format!("/tmp/gofer_tests_object_store{}.db", append_num);

            let db = Engine::new(&Config {
                path: storage_path.clone(),
            })
            .await
            .unwrap();

            Self { db, storage_path }
        }
    }

    impl Deref for TestHarness {
        type Target = Engine;

        fn deref(&self) -> &Self::Target {
            &self.db
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.storage_path);
            let _ = std::fs::remove_file(format!("{}-shm", &self.storage_path));
            let _ = std::fs::remove_file(format!("{}-wal", &self.storage_path));
        }
    }

    #[tokio::test]
    async fn crud() {
        let harness = TestHarness::new().await;

        harness
            .put("test_key", b"test_value".to_vec(), false)
            .await
            .unwrap();

        let value = harness.get("test_key").await.unwrap();
        assert_eq!(value, Value(b"test_value".to_vec()));

        let result = harness
            .put("test_key", b"other_value".to_vec(), false)
            .await
            .unwrap_err();
        assert_eq!(result, ObjectStoreError::Exists);

        harness
            .put("test_key", b"other_value".to_vec(), true)
            .await
            .unwrap();

        let value = harness.get("test_key").await.unwrap();
        assert_eq!(value, Value(b"other_value".to_vec()));

        harness.delete("test_key").await.unwrap();

        let result = harness.get("test_key").await.unwrap_err();
        assert_eq!(result, ObjectStoreError::NotFound);
    }

    #[tokio::test]
    async fn list_keys_honors_prefix() {
        let harness = TestHarness::new().await;

        harness
            .put("alpha_one", b"1".to_vec(), false)
            .await
            .unwrap();
        harness
            .put("alpha_two", b"2".to_vec(), false)
            .await
            .unwrap();
        harness
            .put("beta_one", b"3".to_vec(), false)
            .await
            .unwrap();

        let keys = harness.list_keys("alpha_").await.unwrap();
        assert_eq!(keys, vec!["alpha_one".to_string(), "alpha_two".to_string()]);

        let keys = harness.list_keys("gamma_").await.unwrap();
        assert!(keys.is_empty());
    }
}
