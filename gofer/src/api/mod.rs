//! The API package for Gofer; contains the domain models and the typed operations that transport
//! layers wrap.

pub mod deployments;
pub mod event_utils;
pub mod events;
pub mod extensions;
pub mod external;
pub mod namespaces;
pub mod objects;
pub mod permissioning;
pub mod pipeline_configs;
pub mod pipelines;
pub mod run_utils;
pub mod runs;
pub mod secrets;
pub mod subscriptions;
pub mod task_executions;
pub mod tasks;
pub mod tokens;

use crate::{conf, object_store, scheduler, secret_store, storage};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use strum::{Display, EnumString};

/// GOFER_EOF is a special string marker included at the end of log files. It denotes that no
/// further logs will be written. This provides the functionality for downstream applications to
/// follow log files without also having to monitor the container for state.
pub const GOFER_EOF: &str = "GOFER_EOF";

/// The typed error surface for every API operation. Transport layers map these onto their own
/// status codes.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Exists(String),

    /// The target entity was in an invalid state for the operation: disabled pipelines,
    /// parallelism limits, malformed identifiers.
    #[error("{0}")]
    FailedPrecondition(String),

    #[error("could not authenticate; {0}")]
    Unauthenticated(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("internal error occurred; {0}")]
    Internal(String),

    #[error("{0}")]
    Unavailable(String),
}

impl From<storage::StorageError> for ApiError {
    fn from(err: storage::StorageError) -> Self {
        match err {
            storage::StorageError::NotFound => {
                ApiError::NotFound("requested entity not found".into())
            }
            storage::StorageError::Exists => ApiError::Exists("entity already exists".into()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

/// Set up process-wide structured logging from the configured level. Safe to call more than
/// once; only the first initialization wins.
pub fn init_logging(log_level: &str, pretty: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // A failed init just means a subscriber was already registered.
    let _ = if pretty {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    };
}

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Identifiers are used as the primary key in most of Gofer's resources. They're defined by the
/// user and therefore should have some sane bounds: 3-32 characters, alphanumerics and
/// underscores only.
pub fn is_valid_identifier(id: &str) -> Result<(), ApiError> {
    let alphanumeric_w_underscore = regex!("^[a-zA-Z0-9_]+$");

    if id.len() > 32 {
        return Err(ApiError::InvalidArgument(format!(
            "'{id}' is not a valid identifier; length cannot be greater than 32"
        )));
    }

    if id.len() < 3 {
        return Err(ApiError::InvalidArgument(format!(
            "'{id}' is not a valid identifier; length cannot be less than 3"
        )));
    }

    if !alphanumeric_w_underscore.is_match(id) {
        return Err(ApiError::InvalidArgument(format!(
            "'{id}' is not a valid identifier; can only be made up of alphanumeric and underscore characters"
        )));
    }

    Ok(())
}

/// The sources for which a variable can come from. Denoting the sources allows the transport
/// layer to redact values appropriately.
#[derive(Debug, Display, EnumString, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum VariableSource {
    PipelineConfig,
    System,
    RunOptions,
    Extension,
}

/// A variable is a key/value pair injected into a task's container environment at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
    pub source: VariableSource,
}

/// Gofer allows users to enter special interpolation strings such that special functionality is
/// substituted when Gofer reads those strings from a pipeline configuration.
#[derive(Debug, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum InterpolationKind {
    /// pipeline_secret{{\<key\>}}
    PipelineSecret,

    /// global_secret{{\<key\>}}
    GlobalSecret,

    /// pipeline_object{{\<key\>}}
    PipelineObject,

    /// run_object{{\<key\>}}
    RunObject,
}

/// Checks a string for the existence of an interpolation format. ex: "pipeline_secret{{ example }}".
/// If an interpolation was found we return Some, if not (the string was just a plain string) we
/// return None. Within the Some type is the kind of interpolation found and the key within.
///
/// Currently the supported interpolation syntaxes are:
///   - `pipeline_secret{{ example }}` for inserting from the pipeline secret store.
///   - `global_secret{{ example }}` for inserting from the global secret store.
///   - `pipeline_object{{ example }}` for inserting from the pipeline object store.
///   - `run_object{{ example }}` for inserting from the run object store.
pub fn parse_interpolation_syntax(raw_input: &str) -> Option<(InterpolationKind, String)> {
    let raw_input = raw_input.trim();

    let bracket_index = raw_input.find("{{")?;

    let interpolation_kind = match InterpolationKind::from_str(&raw_input[..bracket_index]) {
        Ok(kind) => kind,
        Err(_) => return None,
    };

    if !raw_input.ends_with("}}") {
        return None;
    }

    let key = &raw_input[bracket_index + 2..raw_input.len() - 2];

    Some((interpolation_kind, key.trim().to_string()))
}

/// Gofer allows users to use secrets and objects from its built-in stores. To facilitate this the
/// user includes a special string in the "variables" field within a pipeline's tasks or a run.
/// Those special strings are decoded here.
///
/// Interpolation happens only at container dispatch; at every other point the raw reference
/// string is what gets stored and displayed.
///
/// The 'run_id' is optional here since interpolation runs in two separate contexts. The first is
/// when we process a new run, in which case there might be run-specific objects to interpolate.
/// The second is during pipeline subscriptions, where there is no run to speak of.
pub async fn interpolate_vars(
    api: &Api,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: Option<u64>,
    variables: &[Variable],
) -> Result<Vec<Variable>> {
    let mut variable_list = vec![];

    for variable in variables {
        let (interpolation_kind, key) = match parse_interpolation_syntax(&variable.value) {
            Some((kind, key)) => (kind, key),
            None => {
                variable_list.push(variable.to_owned());
                continue;
            }
        };

        let value = match interpolation_kind {
            InterpolationKind::PipelineSecret => {
                let secret = api
                    .secret_store
                    .get(&secrets::pipeline_secret_store_key(
                        namespace_id,
                        pipeline_id,
                        &key,
                    ))
                    .await
                    .with_context(|| format!("Could not retrieve pipeline secret '{key}'"))?;

                String::from_utf8_lossy(&secret.0).to_string()
            }
            InterpolationKind::GlobalSecret => {
                let mut conn = api
                    .storage
                    .conn()
                    .await
                    .context("Could not establish connection to database during interpolation")?;

                let key_metadata = storage::secret_store_global_keys::get(&mut conn, &key)
                    .await
                    .with_context(|| format!("Could not retrieve global secret '{key}'"))?;

                let key_metadata = secrets::Secret::try_from(key_metadata)?;

                if !key_metadata.is_allowed_namespace(namespace_id) {
                    bail!(
                        "Global secret '{}' cannot be used from namespace '{}'; valid namespaces: {:?}",
                        key_metadata.key,
                        namespace_id,
                        key_metadata.namespaces
                    );
                }

                let secret = api
                    .secret_store
                    .get(&secrets::global_secret_store_key(&key_metadata.key))
                    .await
                    .with_context(|| format!("Could not retrieve global secret '{key}'"))?;

                String::from_utf8_lossy(&secret.0).to_string()
            }
            InterpolationKind::PipelineObject => {
                let object = api
                    .object_store
                    .get(&objects::pipeline_object_store_key(
                        namespace_id,
                        pipeline_id,
                        &key,
                    ))
                    .await
                    .with_context(|| format!("Could not retrieve pipeline object '{key}'"))?;

                String::from_utf8_lossy(&object.0).to_string()
            }
            InterpolationKind::RunObject => {
                let run_id = match run_id {
                    Some(run_id) => run_id,
                    None => continue,
                };

                let object = api
                    .object_store
                    .get(&objects::run_object_store_key(
                        namespace_id,
                        pipeline_id,
                        run_id,
                        &key,
                    ))
                    .await
                    .with_context(|| format!("Could not retrieve run object '{key}'"))?;

                String::from_utf8_lossy(&object.0).to_string()
            }
        };

        variable_list.push(Variable {
            key: variable.key.clone(),
            value,
            source: variable.source.clone(),
        });
    }

    Ok(variable_list)
}

/// Holds all objects that need to exist for the entire runtime of the service.
///
/// Construct it once at startup and share it behind an [`Arc`]; every operation, background loop,
/// and run shepherd borrows from it.
#[derive(Debug)]
pub struct Api {
    /// The API configuration read in at init.
    pub conf: conf::api::ApiConfig,

    /// `Storage` represents the main backend storage implementation. Gofer stores most of its
    /// critical state information here.
    pub storage: storage::Db,

    /// The mechanism in which Gofer runs its containers (tasks).
    pub scheduler: Arc<dyn scheduler::Scheduler>,

    /// The mechanism in which Gofer stores pipeline and run level objects.
    pub object_store: Arc<dyn object_store::ObjectStore>,

    /// The mechanism in which Gofer manages pipeline secrets.
    pub secret_store: Arc<dyn secret_store::SecretStore>,

    /// Acts as an event bus for the application. It is used throughout the whole application to
    /// give different parts the ability to listen for and respond to events that might happen in
    /// other parts.
    pub event_bus: event_utils::EventBus,

    /// An in-memory mapping of currently registered and started extensions. These extensions are
    /// registered on startup and launched as long running containers via the scheduler. Gofer
    /// refers to this cache as a way to communicate quickly with the containers and their
    /// potentially changing endpoints.
    pub extensions: DashMap<String, extensions::Extension>,

    /// Cancellation handles for every run this process is currently shepherding, keyed by
    /// [`run_utils::run_key`]. Cancellation marks intent here; the shepherd's observers do the
    /// actual state transitions.
    pub in_flight_runs: DashMap<String, Arc<run_utils::RunCancellation>>,
}

impl Api {
    /// Assemble the core from pre-built backends. Starts the eventbus prune loop but does not
    /// touch the scheduler; callers that want extensions running follow up with
    /// [`extensions::start_extensions`].
    pub fn new(
        conf: conf::api::ApiConfig,
        storage: storage::Db,
        scheduler: Arc<dyn scheduler::Scheduler>,
        object_store: Arc<dyn object_store::ObjectStore>,
        secret_store: Arc<dyn secret_store::SecretStore>,
    ) -> Arc<Self> {
        let event_bus = event_utils::EventBus::new(
            storage.clone(),
            conf.api.event_log_retention,
            conf.api.event_prune_interval,
        );

        Arc::new(Self {
            conf,
            storage,
            scheduler,
            object_store,
            secret_store,
            event_bus,
            extensions: DashMap::new(),
            in_flight_runs: DashMap::new(),
        })
    }

    /// Initialize every backend from configuration and boot the core: logging, storage,
    /// scheduler, both stores, the default namespace, and previously installed extensions.
    pub async fn start(conf: conf::api::ApiConfig) -> Result<Arc<Self>> {
        init_logging(&conf.api.log_level, conf.development.pretty_logging);

        let storage = storage::Db::new(&conf.server.storage_path)
            .await
            .context("Could not initialize storage")?;

        let scheduler = scheduler::init_scheduler(&conf.scheduler)
            .await
            .context("Could not initialize scheduler")?;

        let object_store = object_store::init_object_store(&conf.object_store)
            .await
            .context("Could not initialize object store")?;

        let secret_store = secret_store::init_secret_store(&conf.secret_store)
            .await
            .context("Could not initialize secret store")?;

        let api = Api::new(conf, storage, scheduler, object_store, secret_store);

        namespaces::create_default_namespace(&api)
            .await
            .context("Could not create default namespace")?;

        extensions::start_extensions(api.clone())
            .await
            .context("Could not start extensions")?;

        Ok(api)
    }
}

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod pipeline_service_tests;

#[cfg(test)]
mod run_lifecycle_tests;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc", true)]
    #[case("valid_identifier_123", true)]
    #[case("ab", false)]
    #[case("", false)]
    #[case("has-hyphen", false)]
    #[case("has space", false)]
    #[case("waaaaaaaaaaaay_toooooooo_loooooong_for_an_id", false)]
    fn identifier_grammar_round_trip(#[case] id: &str, #[case] valid: bool) {
        assert_eq!(is_valid_identifier(id).is_ok(), valid);
    }

    #[test]
    fn parse_interpolation_syntax_extracts_kind_and_key() {
        let (kind, key) = parse_interpolation_syntax("pipeline_secret{{ some_key }}").unwrap();
        assert!(matches!(kind, InterpolationKind::PipelineSecret));
        assert_eq!(key, "some_key");

        let (kind, key) = parse_interpolation_syntax("global_secret{{other}}").unwrap();
        assert!(matches!(kind, InterpolationKind::GlobalSecret));
        assert_eq!(key, "other");

        assert!(parse_interpolation_syntax("just a normal value").is_none());
        assert!(parse_interpolation_syntax("unknown_kind{{ key }}").is_none());
        assert!(parse_interpolation_syntax("pipeline_secret{{ unterminated").is_none());
    }
}
