//! The extension side of the plugin protocol.
//!
//! Extension binaries accept two subcommands: `server` runs the extension, `installer` emits
//! JSON install instructions to stdout for tooling to consume. When run as a server the process
//! reads its entire configuration from a fixed set of `GOFER_EXTENSION_SYSTEM_*` environment
//! variables handed to it by the main process, exposes the protocol routes over TLS, and
//! requires its startup key as a bearer token on every inbound request.

pub mod api;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{error, info};

/// The environment variables every extension reads on startup. The main process injects these
/// when it launches the extension container.
pub const ENV_ID: &str = "GOFER_EXTENSION_SYSTEM_ID";
pub const ENV_KEY: &str = "GOFER_EXTENSION_SYSTEM_KEY";
pub const ENV_GOFER_HOST: &str = "GOFER_EXTENSION_SYSTEM_GOFER_HOST";
pub const ENV_BIND_ADDRESS: &str = "GOFER_EXTENSION_SYSTEM_BIND_ADDRESS";
pub const ENV_LOG_LEVEL: &str = "GOFER_EXTENSION_SYSTEM_LOG_LEVEL";
pub const ENV_USE_TLS: &str = "GOFER_EXTENSION_SYSTEM_USE_TLS";
pub const ENV_TLS_CERT: &str = "GOFER_EXTENSION_SYSTEM_TLS_CERT";
pub const ENV_TLS_KEY: &str = "GOFER_EXTENSION_SYSTEM_TLS_KEY";

/// Represents different extension failure possibilities. These errors are meant to be consumed
/// by extension authors.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("system environment variable '{0}' missing or empty but required")]
    RequiredSystemEnvVarMissing(String),

    #[error("encountered an error while attempting to parse system env vars; {0}")]
    SystemEnvVarError(String),

    #[error("error encountered during http server startup; {0}")]
    ServerError(String),
}

/// The configuration the main process hands an extension on startup.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// The unique identifier this extension was registered under.
    pub id: String,

    /// The key inbound requests must present as a bearer token.
    pub key: String,

    /// The address of the Gofer API, used when an extension wants to call back into Gofer.
    pub gofer_host: String,

    /// The address the extension's own server binds to.
    pub bind_address: String,

    /// Log level for the extension's own logging.
    pub log_level: String,

    /// TLS material in PEM form. When use_tls is off the extension serves plaintext, which is
    /// only acceptable for local development.
    pub use_tls: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

fn required_env(name: &str) -> Result<String, ExtensionError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ExtensionError::RequiredSystemEnvVarMissing(name.to_string())),
    }
}

impl SystemConfig {
    pub fn from_env() -> Result<Self, ExtensionError> {
        let use_tls = env::var(ENV_USE_TLS)
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .map_err(|e| ExtensionError::SystemEnvVarError(e.to_string()))?;

        let (tls_cert, tls_key) = if use_tls {
            (
                Some(required_env(ENV_TLS_CERT)?),
                Some(required_env(ENV_TLS_KEY)?),
            )
        } else {
            (env::var(ENV_TLS_CERT).ok(), env::var(ENV_TLS_KEY).ok())
        };

        Ok(SystemConfig {
            id: required_env(ENV_ID)?,
            key: required_env(ENV_KEY)?,
            gofer_host: required_env(ENV_GOFER_HOST)?,
            bind_address: env::var(ENV_BIND_ADDRESS)
                .unwrap_or_else(|_| "0.0.0.0:8082".to_string()),
            log_level: env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            use_tls,
            tls_cert,
            tls_key,
        })
    }
}

/// The interface an extension implements. The sdk owns the server plumbing; authors implement
/// these six calls and hand the result to [`run`].
#[async_trait]
pub trait Extension: Send + Sync {
    /// Report identity and documentation. Also doubles as the health check the main process
    /// polls after starting the extension.
    async fn info(&self) -> Result<api::InfoResponse>;

    /// A pipeline wants events from this extension.
    async fn subscribe(&self, request: api::SubscribeRequest) -> Result<()>;

    /// A pipeline no longer wants events from this extension.
    async fn unsubscribe(&self, request: api::UnsubscribeRequest) -> Result<()>;

    /// Long-poll for fired trigger events. Implementations should block for their poll window
    /// and return an empty response when nothing happened.
    async fn watch(&self) -> Result<api::WatchResponse>;

    /// An opaque payload arrived from the outside world for this extension.
    async fn external_event(&self, request: api::ExternalEventRequest) -> Result<()>;

    /// The extension is being uninstalled; release any resources held outside the process
    /// (webhooks, remote registrations). The process itself is stopped separately.
    async fn uninstall(&self) -> Result<()>;

    /// The process is about to exit; release any held resources.
    async fn shutdown(&self);
}

/// A single step of an extension's interactive install flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallInstruction {
    /// Print a message to the user.
    Message { text: String },

    /// Ask the user for a value that becomes one of the extension's config settings.
    Query { text: String, config_key: String },
}

/// The JSON document an extension's `installer` subcommand emits on stdout. Install tooling
/// walks the instructions to collect the settings the extension needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallInstructions {
    pub instructions: Vec<InstallInstruction>,
}

impl InstallInstructions {
    pub fn message(mut self, text: &str) -> Self {
        self.instructions.push(InstallInstruction::Message {
            text: text.to_string(),
        });
        self
    }

    pub fn query(mut self, text: &str, config_key: &str) -> Self {
        self.instructions.push(InstallInstruction::Query {
            text: text.to_string(),
            config_key: config_key.to_string(),
        });
        self
    }

    pub fn json(&self) -> Result<String> {
        serde_json::to_string(self).context("Could not serialize install instructions")
    }
}

/// The entrypoint extension binaries call from main. Dispatches on the subcommand:
/// * `server` — start the extension and serve the protocol until shutdown.
/// * `installer` — print the given install instructions as JSON and exit.
pub async fn run(
    extension: impl Extension + 'static,
    install_instructions: InstallInstructions,
) -> Result<()> {
    let subcommand = env::args().nth(1).unwrap_or_default();

    match subcommand.as_str() {
        "server" => serve(Arc::new(extension), install_instructions).await,
        "installer" => {
            println!("{}", install_instructions.json()?);
            Ok(())
        }
        _ => Err(anyhow!(
            "unknown subcommand '{subcommand}'; extensions accept 'server' or 'installer'"
        )),
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

fn build_tls_acceptor(config: &SystemConfig) -> Result<TlsAcceptor> {
    let cert_pem = config
        .tls_cert
        .as_ref()
        .ok_or_else(|| anyhow!("tls certificate missing"))?;
    let key_pem = config
        .tls_key
        .as_ref()
        .ok_or_else(|| anyhow!("tls key missing"))?;

    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .context("Could not parse tls certificate")?;

    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("Could not parse tls key")?
        .ok_or_else(|| anyhow!("no private key found in tls key pem"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Could not build tls server config")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn serve(
    extension: Arc<dyn Extension>,
    install_instructions: InstallInstructions,
) -> Result<()> {
    let config = SystemConfig::from_env()?;

    init_logging(&config.log_level);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Could not bind to address '{}'", config.bind_address))?;

    let tls_acceptor = if config.use_tls {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };

    let shutdown = Arc::new(Notify::new());
    let install_instructions = Arc::new(install_instructions);

    info!(
        extension_id = config.id,
        bind_address = config.bind_address,
        tls = config.use_tls,
        "Started extension server"
    );

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted.context("Could not accept connection")?,
            _ = shutdown.notified() => break,
        };

        let extension = extension.clone();
        let key = config.key.clone();
        let shutdown = shutdown.clone();
        let install_instructions = install_instructions.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let service = service_fn(move |request| {
                handle_request(
                    extension.clone(),
                    key.clone(),
                    shutdown.clone(),
                    install_instructions.clone(),
                    request,
                )
            });

            let result = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                    }
                    Err(e) => {
                        error!(error = %e, "Could not complete tls handshake");
                        return;
                    }
                },
                None => {
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                }
            };

            if let Err(e) = result {
                error!(error = %e, "Error while serving connection");
            }
        });
    }

    extension.shutdown().await;

    info!("Extension server shut down");

    Ok(())
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn respond_json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => respond(StatusCode::OK, body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{{\"error\": \"{e}\"}}"),
        ),
    }
}

fn respond_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    respond(status, format!("{{\"error\": \"{message}\"}}"))
}

async fn read_json<T: for<'de> Deserialize<'de>>(request: Request<Incoming>) -> Result<T> {
    let body = request
        .into_body()
        .collect()
        .await
        .context("Could not read request body")?
        .to_bytes();

    serde_json::from_slice(&body).context("Could not deserialize request body")
}

async fn handle_request(
    extension: Arc<dyn Extension>,
    key: String,
    shutdown: Arc<Notify>,
    install_instructions: Arc<InstallInstructions>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    // Every inbound call must present the startup key; there is no anonymous surface at all.
    let authorized = request
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {key}"))
        .unwrap_or(false);

    if !authorized {
        return Ok(respond_error(
            StatusCode::UNAUTHORIZED,
            "request did not include a valid authorization key",
        ));
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match (method.as_str(), path.as_str()) {
        ("GET", api::INFO_ROUTE) => match extension.info().await {
            Ok(info) => respond_json(&info),
            Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        ("POST", api::SUBSCRIBE_ROUTE) => match read_json(request).await {
            Ok(subscribe_request) => match extension.subscribe(subscribe_request).await {
                Ok(()) => respond(StatusCode::CREATED, "{}".into()),
                Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            Err(e) => respond_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        ("POST", api::UNSUBSCRIBE_ROUTE) => match read_json(request).await {
            Ok(unsubscribe_request) => match extension.unsubscribe(unsubscribe_request).await {
                Ok(()) => respond(StatusCode::OK, "{}".into()),
                Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            Err(e) => respond_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        ("GET", api::WATCH_ROUTE) => match extension.watch().await {
            Ok(watch_response) => respond_json(&watch_response),
            Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        ("POST", api::EXTERNAL_EVENT_ROUTE) => match read_json(request).await {
            Ok(event_request) => match extension.external_event(event_request).await {
                Ok(()) => respond(StatusCode::OK, "{}".into()),
                Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            Err(e) => respond_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        ("GET", api::INSTALL_ROUTE) => respond_json(install_instructions.as_ref()),
        ("POST", api::UNINSTALL_ROUTE) => match extension.uninstall().await {
            Ok(()) => respond(StatusCode::OK, "{}".into()),
            Err(e) => respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        ("POST", api::SHUTDOWN_ROUTE) => {
            shutdown.notify_one();
            respond(StatusCode::OK, "{}".into())
        }
        _ => respond_error(StatusCode::NOT_FOUND, "route not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_config_requires_id_and_key() {
        // Env var based tests mutate process state; keep them in one place to avoid races.
        env::remove_var(ENV_ID);
        env::remove_var(ENV_KEY);
        env::remove_var(ENV_GOFER_HOST);

        let err = SystemConfig::from_env().unwrap_err();
        assert_eq!(
            err,
            ExtensionError::RequiredSystemEnvVarMissing(ENV_ID.to_string())
        );

        env::set_var(ENV_ID, "interval");
        env::set_var(ENV_KEY, "some_key");
        env::set_var(ENV_GOFER_HOST, "http://localhost:8080");

        let config = SystemConfig::from_env().unwrap();
        assert_eq!(config.id, "interval");
        assert_eq!(config.bind_address, "0.0.0.0:8082");
        assert!(!config.use_tls);

        env::remove_var(ENV_ID);
        env::remove_var(ENV_KEY);
        env::remove_var(ENV_GOFER_HOST);
    }

    #[test]
    fn install_instructions_serialize_to_json() {
        let instructions = InstallInstructions::default()
            .message("This extension polls on an interval.")
            .query("What should the minimum interval be?", "min_interval");

        let json = instructions.json().unwrap();
        assert!(json.contains("min_interval"));

        let parsed: InstallInstructions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, instructions);
    }
}
