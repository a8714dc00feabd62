use bollard::errors::Error as BollardError; // Alias bollard error
use relaunch_common::UpdateError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like orchestrator)
pub use bollard;
pub use relaunch_common as common;

pub mod client;
pub mod diff;
pub mod image_ref;
pub mod lifecycle;
pub mod links;
pub mod snapshot;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Docker API error: {0}")]
    Api(#[source] BollardError),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            other => EngineError::Api(other),
        }
    }
}

// Engine failures only become an UpdateError where the failed operation is known.
pub(crate) fn inspect_error(target: &str, err: EngineError) -> UpdateError {
    UpdateError::Inspect {
        target: target.to_string(),
        reason: err.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub use client::{
    BollardEngine, ContainerInfo, ContainerRef, DockerConnector, EngineClient, EngineConnector,
    EngineSettings, ImageInfo, RegistryCredentials,
};
pub use diff::RuntimeConfig;
pub use lifecycle::{LifecyclePolicy, Sequencer};
pub use snapshot::ContainerSnapshot;
pub use tls::{SecureChannel, TlsPaths};
