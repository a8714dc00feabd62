// Shared vocabulary for the relaunch crates: the inbound push notification,
// the update error taxonomy and the per-container outcome of a run.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("failed to load TLS credentials from {path}: {reason}")]
    CredentialLoad { path: String, reason: String },

    #[error("container engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("failed to inspect {target}: {reason}")]
    Inspect { target: String, reason: String },

    #[error("malformed link {0:?}")]
    MalformedLink(String),

    #[error("failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("failed to signal container [{name}] ({id}): {reason}")]
    Stop {
        name: String,
        id: String,
        reason: String,
    },

    #[error("failed to remove container [{name}] ({id}): {reason}")]
    Remove {
        name: String,
        id: String,
        reason: String,
    },

    #[error("Container [{name}] ({id}) could not be removed")]
    RemovalTimeout { name: String, id: String },

    #[error("failed to create container [{name}]: {reason}")]
    Create { name: String, reason: String },

    #[error("failed to start container [{name}] ({id}): {reason}")]
    Start {
        name: String,
        id: String,
        reason: String,
    },

    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("Invalid request")]
    Unauthorized,

    #[error("batch deadline exceeded before [{name}] was updated")]
    DeadlineExceeded { name: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Payload of a registry push webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PushNotification {
    #[serde(default)]
    pub push_data: PushData,
    #[serde(default, rename = "repository")]
    pub repo: Repository,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PushData {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub pushed_at: f64,
    #[serde(default)]
    pub pusher: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub status: String,
}

impl PushNotification {
    /// Decodes a webhook body. A notification without a repository name
    /// cannot select any container and is rejected.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let notification: PushNotification = serde_json::from_slice(body)
            .map_err(|e| UpdateError::MalformedNotification(e.to_string()))?;
        if notification.repo_name().trim().is_empty() {
            return Err(UpdateError::MalformedNotification(
                "repository.repo_name is empty".to_string(),
            ));
        }
        Ok(notification)
    }

    pub fn repo_name(&self) -> &str {
        &self.repo.repo_name
    }

    pub fn images(&self) -> &[String] {
        &self.push_data.images
    }
}

/// Per-container lifecycle during a replacement. The old instance starts in
/// `Running` (even when the engine reports it exited) and a successful
/// sequence ends in `Replaced`. Pulling is optional and always precedes
/// `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Running,
    Pulling,
    Stopping,
    Stopped,
    Removing,
    Removed,
    Creating,
    Starting,
    Replaced,
    Failed,
}

impl LifecycleState {
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Replaced | Failed, _) => false,
            (_, Failed) => true,
            (Running, Pulling)
            | (Running, Stopping)
            | (Pulling, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Removing)
            | (Removing, Removed)
            | (Removed, Creating)
            | (Creating, Starting)
            | (Starting, Replaced) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Replaced | LifecycleState::Failed)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Running => "running",
            LifecycleState::Pulling => "pulling",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Removing => "removing",
            LifecycleState::Removed => "removed",
            LifecycleState::Creating => "creating",
            LifecycleState::Starting => "starting",
            LifecycleState::Replaced => "replaced",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Replaced { new_id: String },
    Skipped { reason: String },
    Failed { state: LifecycleState, error: UpdateError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOutcome {
    pub name: String,
    pub container_id: String,
    pub status: OutcomeStatus,
}

impl ContainerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed { .. })
    }
}

impl Display for ContainerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OutcomeStatus::Replaced { new_id } => write!(
                f,
                "container [{}] ({}) replaced by {}",
                self.name, self.container_id, new_id
            ),
            OutcomeStatus::Skipped { reason } => write!(
                f,
                "container [{}] ({}) skipped: {}",
                self.name, self.container_id, reason
            ),
            OutcomeStatus::Failed { state, error } => write!(
                f,
                "container [{}] ({}) failed while {}: {}",
                self.name, self.container_id, state, error
            ),
        }
    }
}

/// Result of handling one notification.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: String,
    pub repo_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<ContainerOutcome>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        !self.outcomes.iter().any(ContainerOutcome::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ContainerOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn replaced_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Replaced { .. }))
            .count()
    }

    /// One line per failed container.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
