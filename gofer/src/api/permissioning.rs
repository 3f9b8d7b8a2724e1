use crate::api::{epoch_milli, tokens, Api, ApiError};
use crate::storage;
use tracing::debug;

/// The identity attached to a request after its bearer token has been validated. Transport
/// layers run [`Api::authenticate`] once per request and consult the context before invoking
/// operations.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The id of the validated token.
    pub token_id: String,

    /// Which class of access the token grants.
    pub kind: tokens::TokenType,

    /// The namespace filters attached to the token.
    pub namespaces: Vec<String>,
}

impl AuthContext {
    pub fn is_management(&self) -> bool {
        self.kind == tokens::TokenType::Management
    }

    /// Checks the token's namespace filter list against a target namespace. A filter matches
    /// when it equals the namespace exactly or when, interpreted as a regex, it matches the
    /// namespace. Management tokens skip this check entirely.
    pub fn is_allowed_namespace(&self, namespace_id: &str) -> bool {
        if self.is_management() {
            return true;
        }

        is_allowed_namespace(&self.namespaces, namespace_id)
    }

    /// Convenience wrapper that maps a failed namespace check to the typed error.
    pub fn check_namespace(&self, namespace_id: &str) -> Result<(), ApiError> {
        if self.is_allowed_namespace(namespace_id) {
            return Ok(());
        }

        Err(ApiError::PermissionDenied(format!(
            "token is not authorized for namespace '{namespace_id}'"
        )))
    }

    /// Management-only operations call this before doing anything else.
    pub fn check_management(&self) -> Result<(), ApiError> {
        if self.is_management() {
            return Ok(());
        }

        Err(ApiError::PermissionDenied(
            "this operation requires a management token".into(),
        ))
    }
}

/// The namespace filter check, independent of any token: true iff some filter exactly equals the
/// namespace or some filter is a regex matching it. Unparseable filters are skipped rather than
/// failing the whole check.
pub fn is_allowed_namespace(filters: &[String], namespace_id: &str) -> bool {
    for filter in filters {
        if filter.is_empty() {
            continue;
        }

        if filter == namespace_id {
            return true;
        }

        let filter_regex = match regex::Regex::new(filter) {
            Ok(filter_regex) => filter_regex,
            Err(e) => {
                debug!(filter = filter, error = %e, "Could not parse namespace filter as regex");
                continue;
            }
        };

        if filter_regex.is_match(namespace_id) {
            return true;
        }
    }

    false
}

impl Api {
    /// Validate a presented bearer token and return the identity it grants.
    ///
    /// The plaintext is hashed and looked up against stored hashes; a match must additionally be
    /// enabled and unexpired. Nothing about why validation failed is leaked to the caller.
    pub async fn authenticate(&self, bearer_token: &str) -> Result<AuthContext, ApiError> {
        let hash = tokens::hash_token(bearer_token);

        let mut conn = self.storage.conn().await?;

        let storage_token = storage::tokens::get_by_hash(&mut conn, &hash)
            .await
            .map_err(|err| match err {
                storage::StorageError::NotFound => {
                    ApiError::Unauthenticated("token is not valid".into())
                }
                _ => err.into(),
            })?;

        let token = tokens::Token::try_from(storage_token)?;

        if token.disabled {
            return Err(ApiError::Unauthenticated("token is not valid".into()));
        }

        if token.expires <= epoch_milli() {
            return Err(ApiError::Unauthenticated("token is not valid".into()));
        }

        Ok(AuthContext {
            token_id: token.id,
            kind: token.kind,
            namespaces: token.namespaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["default"], "default", true)]
    #[case(&["default"], "other", false)]
    #[case(&["^devops_.*"], "devops_team_one", true)]
    #[case(&["^devops_.*"], "team_devops", false)]
    #[case(&["exact_ns", "^prod_.*"], "prod_payments", true)]
    #[case(&[], "default", false)]
    #[case(&[""], "default", false)]
    fn namespace_filters_match_exact_or_regex(
        #[case] filters: &[&str],
        #[case] namespace: &str,
        #[case] expected: bool,
    ) {
        let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        assert_eq!(is_allowed_namespace(&filters, namespace), expected);
    }

    #[test]
    fn management_tokens_bypass_namespace_filters() {
        let context = AuthContext {
            token_id: "some_id".into(),
            kind: tokens::TokenType::Management,
            namespaces: vec![],
        };

        assert!(context.is_allowed_namespace("anything"));
        assert!(context.check_management().is_ok());
    }

    #[test]
    fn client_tokens_cannot_pass_management_checks() {
        let context = AuthContext {
            token_id: "some_id".into(),
            kind: tokens::TokenType::Client,
            namespaces: vec!["default".into()],
        };

        assert!(context.check_management().is_err());
        assert!(context.check_namespace("default").is_ok());
        assert!(context.check_namespace("other").is_err());
    }
}
