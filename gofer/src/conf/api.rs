use crate::conf::ConfigType;
use crate::{object_store, scheduler, secret_store};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_API_CONFIG: &str = include_str!("./default_api_config.toml");

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ApiConfig {
    pub api: Api,
    pub development: Development,
    pub extensions: Extensions,
    pub scheduler: Scheduler,
    pub server: Server,
    pub object_store: ObjectStore,
    pub secret_store: SecretStore,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Api {
    /// The limit automatically imposed if the pipeline does not define a limit. 0 is unlimited.
    pub run_parallelism_limit: u64,

    /// Controls how long Gofer will hold onto events before discarding them (in seconds).
    /// This is important factor in disk space and memory footprint.
    ///
    /// Example: Rough math on a 5,000 pipeline Gofer instance with a full 6 months of retention
    /// puts the memory and storage footprint at about 9 GB.
    pub event_log_retention: u64,

    /// How often the background process for pruning events should run (in seconds).
    pub event_prune_interval: u64,

    /// The entire service's log level including extensions.
    pub log_level: String,

    /// The total amount of runs before logs of the oldest run will be deleted.
    pub task_execution_log_retention: u64,

    /// Directory to store task execution log files.
    pub task_execution_logs_dir: String,

    /// Time in seconds the scheduler will wait for a normal user container to stop. When the
    /// timeout is reached the container will be forcefully terminated. A timeout of 0 conveys
    /// that the scheduler should instantly kill containers.
    pub task_execution_stop_timeout: u64,

    /// Time in seconds a launched task execution may go without any scheduler acknowledgment
    /// before it is considered lost and marked failed.
    pub task_execution_orphan_timeout: u64,

    /// Time in seconds that run-injected API tokens stay valid.
    pub run_token_expiry: u64,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Development {
    /// Tells the logging package to use human readable output.
    pub pretty_logging: bool,

    /// Turns off authentication.
    pub bypass_auth: bool,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Extensions {
    /// The time in seconds the scheduler will wait for an extension container to stop. After this
    /// period Gofer will attempt to force stop the container.
    pub stop_timeout: u64,

    /// These are the paths to the certificate pieces the server will pass to each extension.
    pub use_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    /// When attempting to communicate from Gofer to an extension verify the cert is correct and known.
    pub verify_certs: bool,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Scheduler {
    pub engine: scheduler::Engine,
    pub docker: Option<scheduler::docker::Config>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Server {
    /// The URL that users use to interact with Gofer. Should be the full uri to the root.
    /// Ex. http://example.org
    pub url: String,

    /// URL for the Gofer API that can be contacted by extensions. This is important due to
    /// extensions likely being part of a local network and as such they need a different address
    /// than the default 'url' address.
    pub extension_address: String,

    /// Path to Gofer's database.
    pub storage_path: String,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ObjectStore {
    /// The ObjectStore engine used by the backend.
    pub engine: object_store::Engine,

    /// Pipeline objects last forever but are limited in number. This is the total amount of
    /// objects that can be stored per pipeline before Gofer starts deleting the oldest objects,
    /// operating in a ring buffer fashion.
    pub pipeline_object_limit: u64,

    /// Objects stored at the run level are unlimited in number, but only last for a certain
    /// number of runs. The number below controls how many runs until the run objects for the
    /// oldest run will be deleted.
    ///
    /// Ex. an object stored on run number #5 with an expiry of 2 will be deleted on run #7
    /// regardless of run health.
    pub run_object_expiry: u64,

    pub sqlite: Option<object_store::sqlite::Config>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct SecretStore {
    /// The SecretStore engine used by the backend.
    pub engine: secret_store::Engine,
    pub sqlite: Option<secret_store::sqlite::Config>,
}

impl ConfigType for ApiConfig {
    fn default_config() -> &'static str {
        DEFAULT_API_CONFIG
    }

    fn config_paths() -> Vec<std::path::PathBuf> {
        vec![PathBuf::from("/etc/gofer/gofer_web.toml")]
    }

    fn env_prefix() -> &'static str {
        "GOFER_WEB_"
    }
}
