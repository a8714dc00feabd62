//! Process configuration, read from the environment (and `.env` via dotenvy
//! in `main`).

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use relaunch_engine::{EngineSettings, LifecyclePolicy, RegistryCredentials, TlsPaths};
use relaunch_orchestrator::OrchestratorConfig;
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

const TLS_VARS: [&str; 3] = ["DOCKER_CA_CERT_PATH", "DOCKER_CERT_PATH", "DOCKER_KEY_PATH"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("incomplete TLS configuration: {0} must be set together with the other certificate paths")]
    PartialTls(&'static str),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub token: String,
    pub listen_addr: SocketAddr,
    pub engine: EngineSettings,
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let token = get("TOKEN").ok_or(ConfigError::Missing("TOKEN"))?;
        let listen_addr: SocketAddr = parsed(&get, "LISTEN_ADDR", DEFAULT_LISTEN_ADDR.parse().ok())?
            .ok_or(ConfigError::Missing("LISTEN_ADDR"))?;

        let tls = {
            let [ca, cert, key] = TLS_VARS.map(|k| get(k).map(PathBuf::from));
            match (ca, cert, key) {
                (Some(ca_cert), Some(client_cert), Some(client_key)) => Some(TlsPaths {
                    ca_cert,
                    client_cert,
                    client_key,
                }),
                (None, None, None) => None,
                (ca, cert, _) => {
                    let missing = if ca.is_none() {
                        TLS_VARS[0]
                    } else if cert.is_none() {
                        TLS_VARS[1]
                    } else {
                        TLS_VARS[2]
                    };
                    return Err(ConfigError::PartialTls(missing));
                }
            }
        };

        let registry = match (
            get("RELAUNCH_REGISTRY_USERNAME"),
            get("RELAUNCH_REGISTRY_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(RegistryCredentials {
                username,
                password,
                server: get("RELAUNCH_REGISTRY_SERVER"),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("RELAUNCH_REGISTRY_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("RELAUNCH_REGISTRY_USERNAME")),
        };

        let defaults = OrchestratorConfig::default();
        let engine = EngineSettings {
            host: get("DOCKER_HOST"),
            tls,
            timeout_secs: parsed(&get, "DOCKER_TIMEOUT_SECS", Some(120))?.unwrap_or(120),
            registry,
        };

        let policy = LifecyclePolicy {
            stop_signal: get("RELAUNCH_STOP_SIGNAL").unwrap_or(defaults.policy.stop_signal),
            poll_interval: millis(parsed(
                &get,
                "RELAUNCH_POLL_INTERVAL_MS",
                Some(duration_ms(defaults.policy.poll_interval)),
            )?),
            stop_timeout: secs(parsed(
                &get,
                "RELAUNCH_STOP_TIMEOUT_SECS",
                Some(defaults.policy.stop_timeout.as_secs()),
            )?),
        };
        if policy.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RELAUNCH_POLL_INTERVAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let batch_timeout = secs(parsed(
            &get,
            "RELAUNCH_BATCH_TIMEOUT_SECS",
            Some(defaults.batch_timeout.as_secs()),
        )?);

        Ok(Self {
            token,
            listen_addr,
            engine,
            orchestrator: OrchestratorConfig {
                policy,
                batch_timeout,
            },
        })
    }
}

fn parsed<T, G>(get: &G, key: &'static str, default: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn millis(value: Option<u64>) -> Duration {
    Duration::from_millis(value.unwrap_or_default())
}

fn secs(value: Option<u64>) -> Duration {
    Duration::from_secs(value.unwrap_or_default())
}
