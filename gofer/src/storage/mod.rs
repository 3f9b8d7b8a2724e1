//! Contains the data storage interface in which Gofer stores all internal data.
//!
//! As a special concession made we use String to keep epoch millisecond time due to Sqlite's
//! limitation in using only i64. We want most epoch millisecond representations to instead just
//! be u64.
//!
//! ## Transactions
//!
//! Transactions are handled by calling `begin` on the connection object like so:
//!
//! ```ignore
//! let mut tx = conn.begin().await?;
//! some_db_call(&mut tx).await?;
//! some_other_db_call(&mut tx).await?;
//! tx.commit().await?; // Without the commit, changes made inside the transaction are rolled back.
//! ```
//!
//! The tx object borrows the conn object preventing any calls outside the transaction for the
//! scope of tx.
//!
//! Sqlite tuning with help from: https://kerkour.com/sqlite-for-servers

pub mod deployments;
pub mod events;
pub mod extension_registrations;
pub mod extension_subscriptions;
pub mod namespaces;
pub mod object_store_pipeline_keys;
pub mod object_store_run_keys;
pub mod pipeline_configs;
pub mod pipeline_metadata;
pub mod runs;
pub mod secret_store_global_keys;
pub mod secret_store_pipeline_keys;
pub mod task_executions;
pub mod tasks;
pub mod tokens;

use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

/// The maximum amount of rows any single query will return. Callers who need more page through
/// results via the offset parameter.
pub const MAX_ROW_LIMIT: u64 = 200;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("did not find required foreign key for query; {0}")]
    ForeignKeyViolation(String),

    #[error(
        "unexpected storage error occurred; code: {code:?}; message: {message}; query: {query}"
    )]
    GenericDBError {
        code: Option<String>,
        message: String,
        query: String,
    },
}

/// Sqlite Errors are determined by database error code. We map these to the specific code so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => StorageError::Exists,
                    "787" => StorageError::ForeignKeyViolation(database_err.to_string()),
                    _ => StorageError::GenericDBError {
                        code: Some(err_code.to_string()),
                        message: format!("Unmapped error occurred; {}", database_err),
                        query: query.into(),
                    },
                }
            } else {
                StorageError::GenericDBError {
                    code: None,
                    message: database_err.to_string(),
                    query: query.into(),
                }
            }
        }
        _ => StorageError::GenericDBError {
            code: None,
            message: e.to_string(),
            query: query.into(),
        },
    }
}

const SCHEMA: &str = include_str!("./schema.sql");

#[derive(Debug, Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        // The settings here control various sqlite options that are required for a working and
        // performant sqlite database. In order:
        // * create_if_missing: Touch the database file on first boot.
        // * journal_mode: Turns on WAL mode which increases concurrency and reliability.
        // * synchronous: Tells sqlite to sync to disk only at critical junctures. This makes
        //   sqlite speedier and has no downside because we have WAL mode.
        // * foreign_keys: Turns on relational style foreign keys. A must have.
        // * busy_timeout: How long a sqlite query will wait on a locked database before it
        //   returns a "database is locked" error.
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(25)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(e, "schema"))?;

        Ok(Db { pool })
    }

    pub async fn conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rand::prelude::*;
    use std::ops::Deref;

    pub struct TestHarness {
        pub db: Db,
        pub storage_path: String,
    }

    impl TestHarness {
        pub async fn new() -> Self {
            let mut rng = rand::thread_rng();
            let append_num: u32 = rng.gen();
            let storage_path = format!("/tmp/gofer_tests_storage{}.db", append_num);

            let db = Db::new(&storage_path).await.unwrap();

            Self { db, storage_path }
        }
    }

    impl Deref for TestHarness {
        type Target = Db;

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
}
