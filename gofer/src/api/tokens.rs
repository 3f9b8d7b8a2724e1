use crate::api::{epoch_milli, Api, ApiError};
use crate::storage;
use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Display, PartialEq, EnumString, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum TokenType {
    /// Admin token; has access to just about everything.
    Management,

    /// Only has access to the namespaces granted by its filters. Extension tokens and
    /// run-injected tokens are client tokens with their provenance recorded in metadata.
    Client,
}

/// Gofer API Token.
///
/// Only the SHA-256 hash of a token is ever persisted; the plaintext exists exactly once, in the
/// response of the call that created it. The hash field is skipped during serialization so it is
/// never echoed back out of the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    /// Unique identifier for the token.
    pub id: String,

    /// The SHA-256 hash of the token's plaintext.
    #[serde(skip)]
    pub hash: String,

    /// Time in epoch milliseconds when the token was created.
    pub created: u64,

    /// The type of token. Management tokens are essentially root.
    pub kind: TokenType,

    /// List of namespaces this token has access to. Entries are either an exact namespace id or
    /// a regex matched against namespace ids.
    pub namespaces: Vec<String>,

    /// Extra information about this token in label form.
    pub metadata: HashMap<String, String>,

    /// Time in epoch milliseconds when the token expires.
    pub expires: u64,

    /// Disabled tokens cannot be used for requests.
    pub disabled: bool,
}

fn generate_rand_str(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Hash a presented token plaintext the same way stored tokens are hashed.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Creates a new secure token string and returns (token, hash).
pub fn create_new_api_token() -> (String, String) {
    let token = generate_rand_str(32);
    let hash = hash_token(&token);

    (token, hash)
}

impl Token {
    pub fn new(
        hash: &str,
        kind: TokenType,
        namespaces: Vec<String>,
        metadata: HashMap<String, String>,
        expiry: u64, // Seconds from creation that the token should expire.
    ) -> Self {
        let now = epoch_milli();

        Token {
            id: uuid::Uuid::now_v7().to_string(),
            hash: hash.into(),
            created: now,
            kind,
            namespaces,
            metadata,
            expires: now + (expiry * 1000),
            disabled: false,
        }
    }
}

impl TryFrom<storage::tokens::Token> for Token {
    type Error = anyhow::Error;

    fn try_from(value: storage::tokens::Token) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let expires = value.expires.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'expires' from storage value '{}'",
                value.expires
            )
        })?;

        let kind = TokenType::from_str(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' from storage value '{}'",
                value.kind
            )
        })?;

        let namespaces = serde_json::from_str(&value.namespaces)
            .context("Could not parse field 'namespaces' from storage value")?;

        let metadata = serde_json::from_str(&value.metadata)
            .context("Could not parse field 'metadata' from storage value")?;

        Ok(Token {
            id: value.id,
            hash: value.hash,
            created,
            kind,
            namespaces,
            metadata,
            expires,
            disabled: value.disabled,
        })
    }
}

impl TryFrom<Token> for storage::tokens::Token {
    type Error = anyhow::Error;

    fn try_from(value: Token) -> Result<Self> {
        Ok(Self {
            id: value.id,
            hash: value.hash,
            created: value.created.to_string(),
            kind: value.kind.to_string(),
            namespaces: serde_json::to_string(&value.namespaces)
                .context("Could not serialize field 'namespaces' into storage value")?,
            metadata: serde_json::to_string(&value.metadata)
                .context("Could not serialize field 'metadata' into storage value")?,
            expires: value.expires.to_string(),
            disabled: value.disabled,
        })
    }
}

impl Api {
    /// Create a new token. Management access only. Returns the plaintext secret exactly once
    /// along with the stored token record.
    pub async fn create_token(
        &self,
        kind: TokenType,
        namespaces: Vec<String>,
        metadata: HashMap<String, String>,
        expiry: u64,
    ) -> Result<(String, Token), ApiError> {
        let (secret, hash) = create_new_api_token();

        let token = Token::new(&hash, kind, namespaces, metadata, expiry);

        let mut conn = self.storage.conn().await?;

        let storage_token = token
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?;

        storage::tokens::insert(&mut conn, &storage_token).await?;

        Ok((secret, token))
    }

    /// Mint the short-lived client token that gets injected into a run's containers as
    /// `GOFER_API_TOKEN`. Scoped to exactly the run's namespace.
    pub async fn create_run_token(
        &self,
        namespace_id: &str,
        pipeline_id: &str,
    ) -> Result<(String, Token), ApiError> {
        self.create_token(
            TokenType::Client,
            vec![namespace_id.to_string()],
            HashMap::from([
                ("created_by".into(), "run_token_injection".into()),
                ("pipeline_id".into(), pipeline_id.to_string()),
            ]),
            self.conf.api.run_token_expiry,
        )
        .await
    }

    /// List all tokens. Management access only.
    pub async fn list_tokens(&self, offset: u64, limit: u64) -> Result<Vec<Token>, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_tokens = storage::tokens::list(&mut conn, offset, limit).await?;

        let mut tokens = vec![];

        for storage_token in storage_tokens {
            tokens.push(Token::try_from(storage_token)?);
        }

        Ok(tokens)
    }

    /// Get a token by id. Management access only.
    pub async fn get_token(&self, id: &str) -> Result<Token, ApiError> {
        let mut conn = self.storage.conn().await?;

        let storage_token = storage::tokens::get(&mut conn, id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("token '{id}' does not exist"))
                }
                _ => err.into(),
            })?;

        Ok(Token::try_from(storage_token)?)
    }

    /// Re-enable a disabled token. Management access only.
    pub async fn enable_token(&self, id: &str) -> Result<(), ApiError> {
        self.set_token_disabled(id, false).await
    }

    /// Disable a token without deleting it. Management access only.
    pub async fn disable_token(&self, id: &str) -> Result<(), ApiError> {
        self.set_token_disabled(id, true).await
    }

    async fn set_token_disabled(&self, id: &str, disabled: bool) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::tokens::update(
            &mut conn,
            id,
            storage::tokens::UpdatableFields {
                disabled: Some(disabled),
            },
        )
        .await
        .map_err(|err| match err {
            storage::StorageError::NotFound => {
                ApiError::NotFound(format!("token '{id}' does not exist"))
            }
            _ => err.into(),
        })
    }

    /// Delete a token. Management access only.
    pub async fn delete_token(&self, id: &str) -> Result<(), ApiError> {
        let mut conn = self.storage.conn().await?;

        storage::tokens::delete(&mut conn, id)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::NotFound(format!("token '{id}' does not exist"))
                }
                _ => err.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_round_trips_through_hash() {
        let (secret, hash) = create_new_api_token();

        assert_eq!(secret.len(), 32);
        assert_eq!(hash_token(&secret), hash);
        assert_ne!(secret, hash);
    }

    #[test]
    fn serialized_tokens_never_reveal_the_hash() {
        let token = Token::new(
            "some_hash",
            TokenType::Client,
            vec!["default".into()],
            HashMap::new(),
            3600,
        );

        let serialized = serde_json::to_string(&token).unwrap();
        assert!(!serialized.contains("some_hash"));
    }
}
