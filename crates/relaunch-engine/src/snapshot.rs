//! Point-in-time read of a container and of the image it was created from.

use std::collections::{BTreeSet, HashMap};

use bollard::container::Config;
use bollard::models::{ContainerConfig, HostConfig};
use relaunch_common::UpdateError;
use tracing::debug;

use crate::client::{ContainerInfo, ContainerRef, EngineClient};
use crate::diff::{self, RuntimeConfig};
use crate::{inspect_error, links};

#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    id: String,
    names: Vec<String>,
    running: bool,
    image_id: String,
    live: ContainerConfig,
    image_defaults: RuntimeConfig,
    host_config: HostConfig,
}

impl ContainerSnapshot {
    /// Inspects the container and its source image in one step.
    pub async fn identify(
        engine: &dyn EngineClient,
        container: &ContainerRef,
    ) -> Result<Self, UpdateError> {
        let info = engine
            .inspect_container(&container.id)
            .await
            .map_err(|e| inspect_error(&container.id, e))?;
        Self::from_info(engine, container.names.clone(), info).await
    }

    /// Like [`identify`](Self::identify), but a container removed since it
    /// was listed yields `None`. A missing image is still an error.
    pub async fn identify_if_present(
        engine: &dyn EngineClient,
        container: &ContainerRef,
    ) -> Result<Option<Self>, UpdateError> {
        match engine.inspect_container(&container.id).await {
            Ok(info) => Self::from_info(engine, container.names.clone(), info)
                .await
                .map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(inspect_error(&container.id, e)),
        }
    }

    /// Re-reads the container currently holding this snapshot's display
    /// name. `None` when no such container exists any more.
    pub async fn refresh(&self, engine: &dyn EngineClient) -> Result<Option<Self>, UpdateError> {
        let name = self.display_name();
        match engine.inspect_container(name).await {
            Ok(info) => {
                let names = vec![info.name.clone()];
                Self::from_info(engine, names, info).await.map(Some)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(inspect_error(name, e)),
        }
    }

    async fn from_info(
        engine: &dyn EngineClient,
        mut names: Vec<String>,
        info: ContainerInfo,
    ) -> Result<Self, UpdateError> {
        if names.is_empty() && !info.name.is_empty() {
            names.push(info.name.clone());
        }
        let image = if info.image_id.is_empty() {
            info.config.image.clone().unwrap_or_default()
        } else {
            info.image_id.clone()
        };
        let image_info = engine
            .inspect_image(&image)
            .await
            .map_err(|e| inspect_error(&image, e))?;
        debug!(container_id = %info.id, image_id = %image_info.id, "Snapshot taken");

        Ok(Self {
            id: info.id,
            names,
            running: info.running,
            image_id: image_info.id,
            live: info.config,
            image_defaults: image_info.defaults,
            host_config: info.host_config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// First reported name without its path prefix.
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .and_then(|n| n.rsplit('/').next())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn source_image(&self) -> Option<&str> {
        self.live.image.as_deref()
    }

    pub fn host_config(&self) -> &HostConfig {
        &self.host_config
    }

    pub fn is_instance_of(&self, repo_name: &str) -> bool {
        self.source_image() == Some(repo_name)
    }

    /// Container ports with a host binding.
    pub fn published_ports(&self) -> BTreeSet<String> {
        self.host_config
            .port_bindings
            .as_ref()
            .map(|bindings| bindings.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reconstructable_config(&self) -> RuntimeConfig {
        diff::diff(
            &RuntimeConfig::from_container_config(&self.live),
            &self.image_defaults,
            &self.published_ports(),
        )
    }

    /// Creation request for a replacement running `image`.
    pub fn replacement_config(&self, image: &str) -> Result<Config<String>, UpdateError> {
        let overrides = self.reconstructable_config();
        let host_config = links::rewrite_links(self.host_config.clone())?;
        let live = &self.live;

        Ok(Config {
            image: Some(image.to_string()),
            working_dir: overrides.working_dir,
            user: overrides.user,
            cmd: overrides.cmd,
            entrypoint: overrides.entrypoint,
            env: overrides.env,
            labels: overrides.labels.map(|l| l.into_iter().collect()),
            volumes: overrides.volumes.map(marker_map),
            exposed_ports: overrides.exposed_ports.map(marker_map),
            attach_stdin: live.attach_stdin,
            attach_stdout: live.attach_stdout,
            attach_stderr: live.attach_stderr,
            tty: live.tty,
            open_stdin: live.open_stdin,
            stdin_once: live.stdin_once,
            healthcheck: live.healthcheck.clone(),
            stop_signal: live.stop_signal.clone(),
            stop_timeout: live.stop_timeout,
            shell: live.shell.clone(),
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

fn marker_map(keys: BTreeSet<String>) -> HashMap<String, HashMap<(), ()>> {
    keys.into_iter().map(|k| (k, HashMap::new())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{container_fixture, EngineCall, RecordingEngine};
    use bollard::models::PortBinding;

    fn engine_with(info: ContainerInfo, defaults: RuntimeConfig) -> RecordingEngine {
        let engine = RecordingEngine::new();
        engine.add_image("sha256:old", defaults, &["org/app"]);
        engine.add_container(info);
        engine
    }

    fn listing(info: &ContainerInfo) -> ContainerRef {
        ContainerRef {
            id: info.id.clone(),
            names: vec![info.name.clone()],
            image: info.config.image.clone().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_identify_inspects_image_by_id() {
        let info = container_fixture("c1", "web", "org/app", "sha256:old");
        let engine = engine_with(info.clone(), RuntimeConfig::default());

        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();

        assert_eq!(snapshot.id(), "c1");
        assert_eq!(snapshot.display_name(), "web");
        assert_eq!(snapshot.image_id(), "sha256:old");
        assert!(engine
            .calls()
            .contains(&EngineCall::InspectImage("sha256:old".to_string())));
    }

    #[tokio::test]
    async fn test_identify_failure_is_an_error() {
        let engine = RecordingEngine::new();
        let missing = ContainerRef {
            id: "gone".to_string(),
            names: vec!["/gone".to_string()],
            image: "org/app".to_string(),
        };
        match ContainerSnapshot::identify(&engine, &missing).await {
            Err(UpdateError::Inspect { target, .. }) => assert_eq!(target, "gone"),
            other => panic!("expected Inspect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identify_if_present_tolerates_removed_container() {
        let engine = RecordingEngine::new();
        let gone = ContainerRef {
            id: "gone".to_string(),
            names: vec!["/gone".to_string()],
            image: "org/app".to_string(),
        };
        assert!(ContainerSnapshot::identify_if_present(&engine, &gone)
            .await
            .unwrap()
            .is_none());

        let info = container_fixture("c1", "web", "org/app", "sha256:pruned");
        engine.add_container(info.clone());
        let err = ContainerSnapshot::identify_if_present(&engine, &listing(&info))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Inspect { ref target, .. } if target == "sha256:pruned"));
    }

    #[tokio::test]
    async fn test_missing_image_is_an_inspect_error() {
        let engine = RecordingEngine::new();
        let info = container_fixture("c1", "web", "org/app", "sha256:pruned");
        engine.add_container(info.clone());
        let err = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Inspect { ref target, .. } if target == "sha256:pruned"));
    }

    #[tokio::test]
    async fn test_is_instance_of_is_exact() {
        let info = container_fixture("c1", "web", "org/app", "sha256:old");
        let engine = engine_with(info.clone(), RuntimeConfig::default());
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();

        assert!(snapshot.is_instance_of("org/app"));
        assert!(!snapshot.is_instance_of("org/app:latest"));
        assert!(!snapshot.is_instance_of("registry.example.com/org/app"));
        assert!(!snapshot.is_instance_of("org/ap"));
        assert!(!snapshot.is_instance_of("org/application"));
    }

    #[tokio::test]
    async fn test_tagged_source_image_does_not_match_bare_repo() {
        let info = container_fixture("c1", "web", "org/app:1.0", "sha256:old");
        let engine = engine_with(info.clone(), RuntimeConfig::default());
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();
        assert!(!snapshot.is_instance_of("org/app"));
        assert!(snapshot.is_instance_of("org/app:1.0"));
    }

    #[tokio::test]
    async fn test_display_name_strips_path() {
        let mut info = container_fixture("c1", "web", "org/app", "sha256:old");
        let engine = engine_with(info.clone(), RuntimeConfig::default());
        info.name = "/compose/web_1".to_string();
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();
        assert_eq!(snapshot.display_name(), "web_1");
    }

    #[tokio::test]
    async fn test_replacement_config_applies_diff_and_links() {
        let mut info = container_fixture("c1", "web", "org/app", "sha256:old");
        info.config.env = Some(vec!["PATH=/usr/bin".to_string(), "MODE=dev".to_string()]);
        info.config.hostname = Some("c1abcdef".to_string());
        info.config.tty = Some(true);
        info.config.exposed_ports = Some(HashMap::from([("80/tcp".to_string(), HashMap::new())]));
        info.host_config = HostConfig {
            links: Some(vec!["/db:/web/database".to_string()]),
            port_bindings: Some(HashMap::from([(
                "80/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some("8080".to_string()),
                }]),
            )])),
            ..Default::default()
        };
        let defaults = RuntimeConfig {
            env: Some(vec!["PATH=/usr/bin".to_string()]),
            exposed_ports: Some(BTreeSet::from(["80/tcp".to_string()])),
            ..Default::default()
        };
        let engine = engine_with(info.clone(), defaults);
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();

        let config = snapshot.replacement_config("org/app").unwrap();
        assert_eq!(config.image.as_deref(), Some("org/app"));
        assert_eq!(config.env, Some(vec!["MODE=dev".to_string()]));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.hostname, None);
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.links, Some(vec!["db:database".to_string()]));
        assert!(host_config.port_bindings.unwrap().contains_key("80/tcp"));
    }

    #[tokio::test]
    async fn test_replacement_config_rejects_malformed_link() {
        let mut info = container_fixture("c1", "web", "org/app", "sha256:old");
        info.host_config.links = Some(vec!["broken".to_string()]);
        let engine = engine_with(info.clone(), RuntimeConfig::default());
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();
        assert!(matches!(
            snapshot.replacement_config("org/app"),
            Err(UpdateError::MalformedLink(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_by_name() {
        let info = container_fixture("c1", "web", "org/app", "sha256:old");
        let engine = engine_with(info.clone(), RuntimeConfig::default());
        let snapshot = ContainerSnapshot::identify(&engine, &listing(&info))
            .await
            .unwrap();

        let fresh = snapshot.refresh(&engine).await.unwrap().unwrap();
        assert_eq!(fresh.id(), "c1");
        assert!(engine
            .calls()
            .contains(&EngineCall::InspectContainer("web".to_string())));

        engine.remove_container("c1", true, false).await.unwrap();
        assert!(snapshot.refresh(&engine).await.unwrap().is_none());
    }
}
