use super::{SecretStore, SecretStoreError, Value};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead},
    Aes256Gcm, KeyInit,
};
use async_trait::async_trait;
use futures::TryFutureExt;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

// Standard nonce size for AES-GCM; the nonce is prepended to each stored ciphertext.
const NONCE_SIZE: usize = 12;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    pub path: String,

    /// Must be at least 32 characters long.
    pub encryption_key: String,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pool: Pool<Sqlite>,
    encryption_key: String,
}

/// Sqlite Errors are determined by database error code. We map these to the specific code so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
fn map_sqlx_error(e: sqlx::Error, query: &str) -> SecretStoreError {
    match e {
        sqlx::Error::RowNotFound => SecretStoreError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => SecretStoreError::Exists,
                    _ => SecretStoreError::Internal(format!(
                        "Error occurred while running secret store query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                SecretStoreError::Internal(format!(
                    "Error occurred while running secret store query; {database_err}; query: {query}"
                ))
            }
        }
        _ => SecretStoreError::Internal(format!(
            "Error occurred while running secret store query; {e:#?}; query: {query}"
        )),
    }
}

fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SecretStoreError::FailedEncryption(e.to_string()))?;

    let mut n = vec![0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut n);
    let nonce = GenericArray::from_slice(&n);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SecretStoreError::FailedEncryption(e.to_string()))?;

    Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
}

fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
    if ciphertext.len() < NONCE_SIZE {
        return Err(SecretStoreError::FailedEncryption(
            "ciphertext is too short and may be malformed".into(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SecretStoreError::FailedEncryption(e.to_string()))?;

    let (nonce, ciphertext) = ciphertext.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| SecretStoreError::FailedEncryption(e.to_string()))
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, SecretStoreError> {
        // AES-256 wants exactly 32 key bytes; longer keys are truncated at use.
        if config.encryption_key.len() < 32 {
            return Err(SecretStoreError::FailedInitPrecondition(
                "secret_store.sqlite.encryption_key must be at least 32 characters".into(),
            ));
        }

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| SecretStoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_options)
            .await
            .map_err(|e| SecretStoreError::Connection(e.to_string()))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| SecretStoreError::Connection(e.to_string()))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS secrets (
    key   TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key)
) STRICT;"#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(e, "create schema"))?;

        Ok(Engine {
            pool,
            encryption_key: config.encryption_key.clone(),
        })
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>, SecretStoreError> {
        self.pool.acquire().await.map_err(|e| {
            SecretStoreError::Connection(format!(
                "Could not establish connection to secret store; {e:?}"
            ))
        })
    }
}

#[async_trait]
impl SecretStore for Engine {
    async fn get(&self, key: &str) -> Result<Value, SecretStoreError> {
        let mut conn = self.conn().await?;

        let query = "SELECT value FROM secrets WHERE key = ?;";

        let encrypted: (Vec<u8>,) = sqlx::query_as(query)
            .bind(key)
            .fetch_one(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        let decrypted_value = decrypt(&self.encryption_key.as_bytes()[..32], &encrypted.0)?;

        Ok(Value(decrypted_value))
    }

    async fn put(&self, key: &str, content: Vec<u8>, force: bool) -> Result<(), SecretStoreError> {
        let encrypted_value = encrypt(&self.encryption_key.as_bytes()[..32], &content)?;

        let mut conn = self.conn().await?;

        let query = if force {
            "INSERT INTO secrets (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value;"
        } else {
            "INSERT INTO secrets (key, value) VALUES (?, ?);"
        };

        sqlx::query(query)
            .bind(key)
            .bind(encrypted_value)
            .execute(&mut *conn)
            .map_ok(|_| ())
            .map_err(|e| map_sqlx_error(e, query))
            .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SecretStoreError> {
        let mut conn = self.conn().await?;

        let query = "SELECT key FROM secrets WHERE key LIKE ? || '%' ORDER BY key;";

        let rows: Vec<(String,)> = sqlx::query_as(query)
            .bind(prefix)
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let mut conn = self.conn().await?;

        let query = "DELETE FROM secrets WHERE key = ?;";

        let result = sqlx::query(query)
            .bind(key)
            .execute(&mut *conn)
            .map_err(|e| map_sqlx_error(e, query))
            .await?;

        if result.rows_affected() == 0 {
            return Err(SecretStoreError::NotFound);
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
            let storage_path = format!("/tmp/gofer_tests_secret_store{}.db", append_num);

            let db = Engine::new(&Config {
                path: storage_path.clone(),
                encryption_key: "mysuperduperdupersupersecretkey_".into(),
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
    async fn crud_round_trips_through_encryption() {
        let harness = TestHarness::new().await;

        harness
            .put("test_key", b"test_value".to_vec(), false)
            .await
            .unwrap();

        let value = harness.get("test_key").await.unwrap();
        assert_eq!(value, Value(b"test_value".to_vec()));

        let result = harness
            .put("test_key", b"other".to_vec(), false)
            .await
            .unwrap_err();
        assert_eq!(result, SecretStoreError::Exists);

        harness
            .put("test_key", b"other".to_vec(), true)
            .await
            .unwrap();

        let value = harness.get("test_key").await.unwrap();
        assert_eq!(value, Value(b"other".to_vec()));

        harness.delete("test_key").await.unwrap();
        assert_eq!(
            harness.get("test_key").await.unwrap_err(),
            SecretStoreError::NotFound
        );
    }

    #[tokio::test]
    async fn short_encryption_key_rejected() {
        let result = Engine::new(&Config {
            path: "/tmp/gofer_tests_secret_store_shortkey.db".into(),
            encryption_key: "too_short".into(),
        })
        .await
        .unwrap_err();

        assert!(matches!(result, SecretStoreError::FailedInitPrecondition(_)));
    }

    #[tokio::test]
    async fn values_are_not_stored_in_plaintext() {
        let harness = TestHarness::new().await;

        harness
            .put("test_key", b"sensitive_password".to_vec(), false)
            .await
            .unwrap();

        let mut conn = harness.conn().await.unwrap();
        let raw: (Vec<u8>,) = sqlx::query_as("SELECT value FROM secrets WHERE key = 'test_key';")
            .fetch_one(&mut *conn)
            .await
            .unwrap();

        assert_ne!(raw.0, b"sensitive_password".to_vec());
    }
}
