use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relaunch_common::{
    BatchReport, ContainerOutcome, LifecycleState, OutcomeStatus, PushNotification, UpdateError,
};
use relaunch_engine::{
    ContainerSnapshot, EngineClient, EngineConnector, LifecyclePolicy, Sequencer,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, Instrument, Span};
use uuid::Uuid;

pub use relaunch_common as common;
pub use relaunch_engine as engine;

mod locks;
pub use locks::NameLocks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub policy: LifecyclePolicy,
    /// No new container sequence is started once this has elapsed.
    pub batch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: LifecyclePolicy::default(),
            batch_timeout: Duration::from_secs(300),
        }
    }
}

// --- Orchestrator Implementation ---
#[derive(Clone)]
pub struct UpdateOrchestrator {
    connector: Arc<dyn EngineConnector>,
    locks: NameLocks,
    config: OrchestratorConfig,
}

impl UpdateOrchestrator {
    pub fn new(connector: Arc<dyn EngineConnector>, config: OrchestratorConfig) -> Self {
        Self {
            connector,
            locks: NameLocks::new(),
            config,
        }
    }

    pub fn locks(&self) -> &NameLocks {
        &self.locks
    }

    /// Re-creates every container that is an instance of the notified
    /// repository. Connection, listing and snapshot failures abort the run;
    /// anything after that is reported per container. The selection phase
    /// is bounded by the batch deadline as a whole.
    #[instrument(skip(self, notification), fields(run_id = tracing::field::Empty, repo = %notification.repo_name()))]
    pub async fn apply(
        &self,
        notification: &PushNotification,
    ) -> Result<BatchReport, UpdateError> {
        let run_id = Uuid::new_v4().to_string();
        Span::current().record("run_id", run_id.as_str());
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.batch_timeout;
        let repo_name = notification.repo_name().to_string();
        info!(images = ?notification.images(), "Handling push notification");

        let selection = timeout_at(deadline, async {
            let engine = self.connector.connect().await?;
            let listing = engine
                .list_containers(true)
                .await
                .map_err(|e| UpdateError::EngineUnreachable(e.to_string()))?;

            let mut matches = Vec::new();
            for container in &listing {
                let Some(snapshot) =
                    ContainerSnapshot::identify_if_present(engine.as_ref(), container).await?
                else {
                    debug!(container_id = %container.id, "Removed since listing, skipping");
                    continue;
                };
                if snapshot.is_instance_of(&repo_name) {
                    matches.push(snapshot);
                } else {
                    debug!(container_id = %snapshot.id(), image = ?snapshot.source_image(), "Not an instance, skipping");
                }
            }
            Ok::<_, UpdateError>((engine, listing.len(), matches))
        })
        .await;
        let (engine, listed, matches) = match selection {
            Ok(selected) => selected?,
            Err(_) => {
                error!(timeout = ?self.config.batch_timeout, "Batch deadline passed while selecting containers");
                return Err(UpdateError::DeadlineExceeded {
                    name: repo_name.clone(),
                });
            }
        };
        info!(matched = matches.len(), listed, "Selected containers");

        let mut handles = Vec::with_capacity(matches.len());
        let mut targets = Vec::with_capacity(matches.len());
        for snapshot in matches {
            targets.push((snapshot.display_name().to_string(), snapshot.id().to_string()));
            let task = update_container(
                engine.clone(),
                self.locks.clone(),
                self.config.policy.clone(),
                snapshot,
                repo_name.clone(),
                deadline,
            );
            handles.push(tokio::spawn(task.in_current_span()));
        }

        let joined = futures::future::join_all(handles).await;
        let outcomes: Vec<ContainerOutcome> = joined
            .into_iter()
            .zip(targets)
            .map(|(result, (name, container_id))| match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(name = %name, error = %e, "Update task aborted");
                    ContainerOutcome {
                        name,
                        container_id,
                        status: OutcomeStatus::Failed {
                            state: LifecycleState::Running,
                            error: UpdateError::Internal(format!("update task aborted: {e}")),
                        },
                    }
                }
            })
            .collect();
        self.locks.prune();

        let report = BatchReport {
            run_id,
            repo_name,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            replaced = report.replaced_count(),
            failed = report.failures().count(),
            "Push notification handled"
        );
        Ok(report)
    }
}

async fn update_container(
    engine: Arc<dyn EngineClient>,
    locks: NameLocks,
    policy: LifecyclePolicy,
    snapshot: ContainerSnapshot,
    repo_name: String,
    deadline: Instant,
) -> ContainerOutcome {
    let name = snapshot.display_name().to_string();

    let outcome = |status| ContainerOutcome {
        name: name.clone(),
        container_id: snapshot.id().to_string(),
        status,
    };
    let failed = |error| {
        outcome(OutcomeStatus::Failed {
            state: LifecycleState::Running,
            error,
        })
    };
    let expired = || failed(UpdateError::DeadlineExceeded { name: name.clone() });

    let Ok(_guard) = timeout_at(deadline, locks.acquire(&name)).await else {
        return expired();
    };

    // Another run may have replaced the container while we waited.
    let refreshed = match timeout_at(deadline, snapshot.refresh(engine.as_ref())).await {
        Ok(refreshed) => refreshed,
        Err(_) => return expired(),
    };
    let current = match refreshed {
        Ok(Some(current)) if current.is_instance_of(&repo_name) => current,
        Ok(Some(current)) => {
            return outcome(OutcomeStatus::Skipped {
                reason: format!(
                    "now an instance of {}",
                    current.source_image().unwrap_or("an unknown image")
                ),
            })
        }
        Ok(None) => {
            return outcome(OutcomeStatus::Skipped {
                reason: "container no longer exists".to_string(),
            })
        }
        Err(e) => return failed(e),
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return expired();
    }

    Sequencer::new(engine, policy)
        .replace(&current, &repo_name, remaining)
        .await
}
