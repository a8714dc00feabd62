//! Replace-in-place sequencing for a single container.

use std::sync::Arc;
use std::time::Duration;

use relaunch_common::{ContainerOutcome, LifecycleState, OutcomeStatus, UpdateError};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::client::EngineClient;
use crate::inspect_error;
use crate::snapshot::ContainerSnapshot;

/// Signal and wait bounds used when stopping a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub stop_signal: String,
    pub poll_interval: Duration,
    /// Bound on each of the two wait loops (stopped, then removed).
    pub stop_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            stop_signal: "SIGTERM".to_string(),
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

struct Progress {
    container_id: String,
    state: LifecycleState,
}

impl Progress {
    fn new(container_id: &str, state: LifecycleState) -> Self {
        Self {
            container_id: container_id.to_string(),
            state,
        }
    }

    fn advance(&mut self, next: LifecycleState) -> Result<(), UpdateError> {
        if !self.state.can_advance_to(next) {
            return Err(UpdateError::Internal(format!(
                "illegal lifecycle transition {} -> {}",
                self.state, next
            )));
        }
        debug!(container_id = %self.container_id, from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        Ok(())
    }
}

enum Observed {
    Done,
    Pending,
}

pub struct Sequencer {
    engine: Arc<dyn EngineClient>,
    policy: LifecyclePolicy,
}

impl Sequencer {
    pub fn new(engine: Arc<dyn EngineClient>, policy: LifecyclePolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    #[instrument(skip(self))]
    pub async fn pull(&self, image: &str) -> Result<(), UpdateError> {
        info!("Pulling image");
        self.engine
            .pull_image(image)
            .await
            .map_err(|e| UpdateError::Pull {
                image: image.to_string(),
                reason: e.to_string(),
            })
    }

    /// Signals, removes and confirms removal of the snapshot's container.
    pub async fn stop(&self, snapshot: &ContainerSnapshot) -> Result<(), UpdateError> {
        let mut progress = Progress::new(snapshot.id(), LifecycleState::Running);
        self.stop_tracked(snapshot, &mut progress).await
    }

    /// Creates and starts a replacement under the snapshot's display name.
    /// Returns the new container's ID.
    pub async fn start(
        &self,
        snapshot: &ContainerSnapshot,
        image: &str,
    ) -> Result<String, UpdateError> {
        let mut progress = Progress::new(snapshot.id(), LifecycleState::Removed);
        self.start_tracked(snapshot, image, &mut progress).await
    }

    /// Pull, stop, then create and start. The pull is bounded by
    /// `pull_budget`; nothing destructive has happened if it runs out.
    #[instrument(skip(self, snapshot, pull_budget), fields(container_id = %snapshot.id(), name = %snapshot.display_name()))]
    pub async fn replace(
        &self,
        snapshot: &ContainerSnapshot,
        image: &str,
        pull_budget: Duration,
    ) -> ContainerOutcome {
        let mut progress = Progress::new(snapshot.id(), LifecycleState::Running);
        let result = self
            .replace_tracked(snapshot, image, pull_budget, &mut progress)
            .await;

        let status = match result {
            Ok(new_id) => {
                info!(new_id = %new_id, "Container replaced");
                OutcomeStatus::Replaced { new_id }
            }
            Err(error) => {
                warn!(state = %progress.state, error = %error, "Container update failed");
                OutcomeStatus::Failed {
                    state: progress.state,
                    error,
                }
            }
        };
        ContainerOutcome {
            name: snapshot.display_name().to_string(),
            container_id: snapshot.id().to_string(),
            status,
        }
    }

    async fn replace_tracked(
        &self,
        snapshot: &ContainerSnapshot,
        image: &str,
        pull_budget: Duration,
        progress: &mut Progress,
    ) -> Result<String, UpdateError> {
        // Build the replacement request up front so a malformed link fails
        // before the old container is touched.
        snapshot.replacement_config(image)?;

        progress.advance(LifecycleState::Pulling)?;
        match timeout(pull_budget, self.pull(image)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(UpdateError::DeadlineExceeded {
                    name: snapshot.display_name().to_string(),
                })
            }
        }

        self.stop_tracked(snapshot, progress).await?;
        self.start_tracked(snapshot, image, progress).await
    }

    async fn stop_tracked(
        &self,
        snapshot: &ContainerSnapshot,
        progress: &mut Progress,
    ) -> Result<(), UpdateError> {
        let id = snapshot.id();
        let name = snapshot.display_name();
        progress.advance(LifecycleState::Stopping)?;

        if snapshot.is_running() {
            info!(container_id = %id, name = %name, signal = %self.policy.stop_signal, "Stopping container");
            match self.engine.kill_container(id, &self.policy.stop_signal).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    warn!(container_id = %id, error = %e, "Stop signal not delivered, continuing");
                }
                Err(e) => {
                    return Err(UpdateError::Stop {
                        name: name.to_string(),
                        id: id.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
            if !self.wait_until_stopped(id).await {
                warn!(
                    container_id = %id,
                    timeout_secs = self.policy.stop_timeout.as_secs(),
                    "Container did not stop in time, removing anyway"
                );
            }
        } else {
            debug!(container_id = %id, "Container not running, skipping stop signal");
        }
        progress.advance(LifecycleState::Stopped)?;

        progress.advance(LifecycleState::Removing)?;
        info!(container_id = %id, "Removing container");
        match self.engine.remove_container(id, true, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container_id = %id, "Container already gone");
            }
            Err(e) => {
                return Err(UpdateError::Remove {
                    name: name.to_string(),
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
        if !self.wait_until_removed(id).await? {
            return Err(UpdateError::RemovalTimeout {
                name: name.to_string(),
                id: id.to_string(),
            });
        }
        progress.advance(LifecycleState::Removed)
    }

    async fn start_tracked(
        &self,
        snapshot: &ContainerSnapshot,
        image: &str,
        progress: &mut Progress,
    ) -> Result<String, UpdateError> {
        let name = snapshot.display_name();
        progress.advance(LifecycleState::Creating)?;
        let config = snapshot.replacement_config(image)?;

        info!(name = %name, image = %image, "Creating container");
        let new_id = self
            .engine
            .create_container(name, config)
            .await
            .map_err(|e| UpdateError::Create {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        progress.advance(LifecycleState::Starting)?;
        info!(container_id = %new_id, name = %name, "Starting container");
        self.engine
            .start_container(&new_id)
            .await
            .map_err(|e| UpdateError::Start {
                name: name.to_string(),
                id: new_id.clone(),
                reason: e.to_string(),
            })?;

        progress.advance(LifecycleState::Replaced)?;
        Ok(new_id)
    }

    /// False when the bound ran out with the container still running. An
    /// inspect failure ends the wait early.
    async fn wait_until_stopped(&self, id: &str) -> bool {
        self.poll(move || async move {
            match self.engine.inspect_container(id).await {
                Ok(info) if info.running => Ok(Observed::Pending),
                Ok(_) => Ok(Observed::Done),
                Err(e) if e.is_not_found() => Ok(Observed::Done),
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Inspect failed while waiting for stop");
                    Ok(Observed::Done)
                }
            }
        })
        .await
        .unwrap_or(true)
    }

    /// Removal is only confirmed by the engine no longer knowing the ID.
    async fn wait_until_removed(&self, id: &str) -> Result<bool, UpdateError> {
        self.poll(move || async move {
            match self.engine.inspect_container(id).await {
                Ok(_) => Ok(Observed::Pending),
                Err(e) if e.is_not_found() => Ok(Observed::Done),
                Err(e) => Err(inspect_error(id, e)),
            }
        })
        .await
    }

    async fn poll<F, Fut>(&self, mut check: F) -> Result<bool, UpdateError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Observed, UpdateError>>,
    {
        let waited = timeout(self.policy.stop_timeout, async {
            loop {
                if let Observed::Done = check().await? {
                    return Ok::<(), UpdateError>(());
                }
                sleep(self.policy.poll_interval).await;
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }
}
