//! In-memory engine double that records every call it receives.
//!
//! Behaves like a small single-host engine: containers can be listed,
//! inspected by ID or name, signalled, removed and created; images are
//! looked up by ID or reference. Knobs simulate the awkward cases (a
//! container that ignores its stop signal, a remove that never completes,
//! failing pulls/creates/starts, slow inspects, listings that are already
//! stale when read).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{ContainerConfig, HostConfig};
use relaunch_common::UpdateError;

use crate::client::{ContainerInfo, ContainerRef, EngineClient, EngineConnector, ImageInfo};
use crate::diff::RuntimeConfig;
use crate::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    List { all: bool },
    InspectContainer(String),
    InspectImage(String),
    Pull(String),
    Create { name: String, image: String },
    Start(String),
    Kill { id: String, signal: String },
    Remove { id: String, force: bool, remove_volumes: bool },
}

#[derive(Default)]
struct EngineState {
    containers: Vec<ContainerInfo>,
    images: HashMap<String, ImageInfo>,
    calls: Vec<EngineCall>,
    created: Vec<(String, Config<String>)>,
    next_id: usize,
    never_stops: bool,
    never_removed: bool,
    fail_pull: Option<String>,
    fail_create: Option<String>,
    fail_start: Option<String>,
    pull_delay: Option<Duration>,
    inspect_delay: Option<Duration>,
    stale: Vec<ContainerRef>,
}

impl EngineState {
    fn position(&self, id_or_name: &str) -> Option<usize> {
        let wanted = id_or_name.trim_start_matches('/');
        self.containers
            .iter()
            .position(|c| c.id == id_or_name || c.name.trim_start_matches('/') == wanted)
    }
}

#[derive(Default)]
pub struct RecordingEngine {
    state: Mutex<EngineState>,
}

/// A running container named `name` created from `image` (recorded source
/// image string) whose image has ID `image_id`.
pub fn container_fixture(id: &str, name: &str, image: &str, image_id: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: format!("/{name}"),
        image_id: image_id.to_string(),
        running: true,
        config: ContainerConfig {
            image: Some(image.to_string()),
            ..Default::default()
        },
        host_config: HostConfig::default(),
    }
}

fn recorded_config(config: &Config<String>) -> ContainerConfig {
    ContainerConfig {
        image: config.image.clone(),
        working_dir: config.working_dir.clone(),
        user: config.user.clone(),
        cmd: config.cmd.clone(),
        entrypoint: config.entrypoint.clone(),
        env: config.env.clone(),
        labels: config.labels.clone(),
        volumes: config.volumes.clone(),
        exposed_ports: config.exposed_ports.clone(),
        tty: config.tty,
        open_stdin: config.open_stdin,
        stop_signal: config.stop_signal.clone(),
        ..Default::default()
    }
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_container(&self, info: ContainerInfo) {
        self.state().containers.push(info);
    }

    /// Registers an image under its ID and under each of `references`.
    pub fn add_image(&self, id: &str, defaults: RuntimeConfig, references: &[&str]) {
        let info = ImageInfo {
            id: id.to_string(),
            defaults,
        };
        let mut state = self.state();
        for reference in references {
            state.images.insert(reference.to_string(), info.clone());
        }
        state.images.insert(id.to_string(), info);
    }

    pub fn set_never_stops(&self, value: bool) {
        self.state().never_stops = value;
    }

    pub fn set_never_removed(&self, value: bool) {
        self.state().never_removed = value;
    }

    pub fn fail_pull(&self, reason: &str) {
        self.state().fail_pull = Some(reason.to_string());
    }

    pub fn fail_create(&self, reason: &str) {
        self.state().fail_create = Some(reason.to_string());
    }

    pub fn fail_start(&self, reason: &str) {
        self.state().fail_start = Some(reason.to_string());
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.state().pull_delay = Some(delay);
    }

    pub fn set_inspect_delay(&self, delay: Duration) {
        self.state().inspect_delay = Some(delay);
    }

    /// Lists a container that is gone by the time anyone inspects it, as
    /// if another client removed it right after the listing.
    pub fn add_stale_listing(&self, id: &str, name: &str, image: &str) {
        self.state().stale.push(ContainerRef {
            id: id.to_string(),
            names: vec![format!("/{name}")],
            image: image.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Name and config of every create call, in order.
    pub fn created(&self) -> Vec<(String, Config<String>)> {
        self.state().created.clone()
    }

    pub fn container(&self, id_or_name: &str) -> Option<ContainerInfo> {
        let state = self.state();
        state.position(id_or_name).map(|i| state.containers[i].clone())
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.state().containers.iter().map(|c| c.id.clone()).collect()
    }

    fn record(&self, call: EngineCall) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl EngineClient for RecordingEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRef>> {
        self.record(EngineCall::List { all });
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerRef {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.config.image.clone().unwrap_or_default(),
            })
            .chain(state.stale.iter().cloned())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.record(EngineCall::InspectContainer(id.to_string()));
        let delay = self.state().inspect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.container(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo> {
        self.record(EngineCall::InspectImage(reference.to_string()));
        self.state()
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {reference}")))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.record(EngineCall::Pull(reference.to_string()));
        let (delay, failure) = {
            let state = self.state();
            (state.pull_delay, state.fail_pull.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(reason) => Err(EngineError::Other(reason)),
            None => Ok(()),
        }
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let image = config.image.clone().unwrap_or_default();
        self.record(EngineCall::Create {
            name: name.to_string(),
            image: image.clone(),
        });
        let mut state = self.state();
        state.created.push((name.to_string(), config.clone()));
        if let Some(reason) = state.fail_create.clone() {
            return Err(EngineError::Other(reason));
        }
        if state.position(name).is_some() {
            return Err(EngineError::Conflict(format!(
                "The container name \"/{name}\" is already in use"
            )));
        }
        state.next_id += 1;
        let id = format!("new-{}", state.next_id);
        let image_id = state
            .images
            .get(&image)
            .map(|i| i.id.clone())
            .unwrap_or(image);
        let info = ContainerInfo {
            id: id.clone(),
            name: format!("/{name}"),
            image_id,
            running: false,
            config: recorded_config(&config),
            host_config: config.host_config.clone().unwrap_or_default(),
        };
        state.containers.push(info);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(EngineCall::Start(id.to_string()));
        let mut state = self.state();
        if let Some(reason) = state.fail_start.clone() {
            return Err(EngineError::Other(reason));
        }
        let index = state
            .position(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        state.containers[index].running = true;
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        self.record(EngineCall::Kill {
            id: id.to_string(),
            signal: signal.to_string(),
        });
        let mut state = self.state();
        let index = state
            .position(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        if !state.containers[index].running {
            return Err(EngineError::Conflict(format!("Container {id} is not running")));
        }
        if !state.never_stops {
            state.containers[index].running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()> {
        self.record(EngineCall::Remove {
            id: id.to_string(),
            force,
            remove_volumes,
        });
        let mut state = self.state();
        let index = state
            .position(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        if state.containers[index].running && !force {
            return Err(EngineError::Conflict(format!(
                "You cannot remove a running container {id}"
            )));
        }
        if !state.never_removed {
            state.containers.remove(index);
        }
        Ok(())
    }
}

/// Hands out the same engine on every connect, or a fixed error.
pub struct RecordingConnector {
    engine: Arc<RecordingEngine>,
    failure: Option<UpdateError>,
    connects: Mutex<usize>,
}

impl RecordingConnector {
    pub fn new(engine: Arc<RecordingEngine>) -> Self {
        Self {
            engine,
            failure: None,
            connects: Mutex::new(0),
        }
    }

    pub fn failing(error: UpdateError) -> Self {
        Self {
            engine: Arc::new(RecordingEngine::new()),
            failure: Some(error),
            connects: Mutex::new(0),
        }
    }

    pub fn engine(&self) -> Arc<RecordingEngine> {
        self.engine.clone()
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EngineConnector for RecordingConnector {
    async fn connect(&self) -> relaunch_common::Result<Arc<dyn EngineClient>> {
        *self.connects.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self.engine.clone())
    }
}
