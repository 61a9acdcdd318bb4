use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors raised by the configuration pipeline and the container scheduler.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Failed to read config file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("Environment '{env}' extends itself through: {chain}")]
    CircularExtends { env: String, chain: String },

    #[error("Name '{name}' is used more than once across services, storages and the proxy")]
    NameCollision { name: String },

    #[error("Invalid port spec '{spec}' for service '{service}'")]
    InvalidPort { service: String, spec: String },

    #[error("No free address left in {prefix}.0/24")]
    SubnetExhausted { prefix: String },

    #[error("No profile registered (looked for '{name}')")]
    ProfileNotFound { name: String },

    #[error("Failed to launch container {container}: {reason}")]
    ContainerLaunch { container: String, reason: String },

    #[error("Service '{service}' gave up after {attempts} attempts waiting for: {pending}")]
    DependencyTimeout {
        service: String,
        attempts: u32,
        pending: String,
    },

    #[error("Template {path:?} failed to render: {reason}")]
    Template { path: PathBuf, reason: String },

    #[error("Hook '{hook}' of service '{service}' failed: {reason}")]
    Hook {
        service: String,
        hook: String,
        reason: String,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::Io {
            path: path.into(),
            source,
        }
    }
}
