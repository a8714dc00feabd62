//! Container engine capability and its bollard-backed implementation.
//!
//! The orchestrator only ever talks to an [`EngineClient`]; a fresh one is
//! produced by an [`EngineConnector`] for every notification so credentials
//! are re-read per run.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerConfig, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use relaunch_common::UpdateError;
use tracing::{debug, info, instrument, warn};

use crate::diff::RuntimeConfig;
use crate::image_ref;
use crate::tls::{self, SecureChannel, TlsPaths};
use crate::{EngineError, Result};

/// Entry of a container listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerRef {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
}

/// Engine-reported state of one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// ID of the image the container was created from.
    pub image_id: String,
    pub running: bool,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub defaults: RuntimeConfig,
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRef>>;
    /// Accepts a container ID or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;
    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo>;
    async fn pull_image(&self, reference: &str) -> Result<()>;
    async fn create_container(&self, name: &str, config: Config<String>) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;
    async fn remove_container(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()>;
}

#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> relaunch_common::Result<Arc<dyn EngineClient>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server: Option<String>,
}

impl From<&RegistryCredentials> for DockerCredentials {
    fn from(creds: &RegistryCredentials) -> Self {
        DockerCredentials {
            username: Some(creds.username.clone()),
            password: Some(creds.password.clone()),
            serveraddress: creds.server.clone(),
            ..Default::default()
        }
    }
}

/// Where and how to reach the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub host: Option<String>,
    pub tls: Option<TlsPaths>,
    pub timeout_secs: u64,
    pub registry: Option<RegistryCredentials>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            host: None,
            tls: None,
            timeout_secs: 120,
            registry: None,
        }
    }
}

// --- DockerConnector Implementation ---

#[derive(Debug, Clone)]
pub struct DockerConnector {
    settings: EngineSettings,
}

impl DockerConnector {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    fn open(&self) -> relaunch_common::Result<Docker> {
        let timeout = self.settings.timeout_secs;
        let engine_err = |e: bollard::errors::Error| UpdateError::EngineUnreachable(e.to_string());

        match (&self.settings.tls, self.settings.host.as_deref()) {
            (Some(paths), host) => {
                // Fails before any connection attempt if the material is unusable.
                let channel = SecureChannel::provision(paths)?;
                tls::install_default_provider();
                let host = host.ok_or_else(|| {
                    UpdateError::EngineUnreachable(
                        "DOCKER_HOST is required for a TLS connection".to_string(),
                    )
                })?;
                let paths = channel.paths();
                Docker::connect_with_ssl(
                    host,
                    Path::new(&paths.client_key),
                    Path::new(&paths.client_cert),
                    Path::new(&paths.ca_cert),
                    timeout,
                    API_DEFAULT_VERSION,
                )
                .map_err(engine_err)
            }
            (None, Some(host)) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, timeout, API_DEFAULT_VERSION).map_err(engine_err)
            }
            (None, Some(host)) => {
                Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION).map_err(engine_err)
            }
            (None, None) => Docker::connect_with_local_defaults().map_err(engine_err),
        }
    }
}

#[async_trait]
impl EngineConnector for DockerConnector {
    #[instrument(skip(self), fields(host = ?self.settings.host, tls = self.settings.tls.is_some()))]
    async fn connect(&self) -> relaunch_common::Result<Arc<dyn EngineClient>> {
        let docker = self.open()?;
        docker
            .ping()
            .await
            .map_err(|e| UpdateError::EngineUnreachable(e.to_string()))?;
        info!("Connected to container engine");
        let credentials = self.settings.registry.as_ref().map(DockerCredentials::from);
        Ok(Arc::new(BollardEngine::new(docker, credentials)))
    }
}

// --- BollardEngine Implementation ---

#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl BollardEngine {
    pub fn new(docker: Docker, credentials: Option<DockerCredentials>) -> Self {
        Self {
            docker,
            credentials,
        }
    }
}

fn key_set<V>(map: HashMap<String, V>) -> BTreeSet<String> {
    map.into_keys().collect()
}

#[async_trait]
impl EngineClient for BollardEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRef>> {
        let options = ListContainersOptions::<String> {
            all,
            size: true,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                Some(ContainerRef {
                    id: summary.id?,
                    names: summary.names.unwrap_or_default(),
                    image: summary.image.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let config = info
            .config
            .ok_or_else(|| EngineError::Other(format!("{id}: inspect returned no config")))?;
        Ok(ContainerInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info.name.unwrap_or_default(),
            image_id: info.image.unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            config,
            host_config: info.host_config.unwrap_or_default(),
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo> {
        let image = self.docker.inspect_image(reference).await?;
        // Missing image config means "no defaults", so every live value is kept.
        let defaults = image
            .config
            .map(|c| RuntimeConfig {
                working_dir: c.working_dir,
                user: c.user,
                cmd: c.cmd,
                entrypoint: c.entrypoint,
                env: c.env,
                labels: c.labels.map(|l| l.into_iter().collect()),
                volumes: c.volumes.map(key_set),
                exposed_ports: c.exposed_ports.map(key_set),
            })
            .unwrap_or_default();
        Ok(ImageInfo {
            id: image.id.unwrap_or_else(|| reference.to_string()),
            defaults,
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (from_image, tag) = image_ref::split_reference(reference);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self
            .docker
            .create_image(Some(options), None, self.credentials.clone());
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!(name = %name, warning = %warning, "Engine warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.to_string(),
        };
        self.docker.kill_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_credentials_conversion() {
        let creds = RegistryCredentials {
            username: "bot".to_string(),
            password: "s3cret".to_string(),
            server: Some("registry.example.com".to_string()),
        };
        let docker: DockerCredentials = (&creds).into();
        assert_eq!(docker.username.as_deref(), Some("bot"));
        assert_eq!(docker.password.as_deref(), Some("s3cret"));
        assert_eq!(docker.serveraddress.as_deref(), Some("registry.example.com"));
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_missing_credentials() {
        let connector = DockerConnector::new(EngineSettings {
            host: Some("tcp://127.0.0.1:2376".to_string()),
            tls: Some(TlsPaths {
                ca_cert: "/nonexistent/ca.pem".into(),
                client_cert: "/nonexistent/cert.pem".into(),
                client_key: "/nonexistent/key.pem".into(),
            }),
            ..Default::default()
        });
        let err = connector.connect().await.err().expect("connect must fail");
        assert!(
            matches!(err, UpdateError::CredentialLoad { .. }),
            "unexpected error: {err}"
        );
    }
}
