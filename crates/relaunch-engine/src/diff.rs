//! Reconstructs the minimal settings needed to re-create a container on top
//! of its image: every value the container merely inherited from the image
//! is dropped, every operator override is kept.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bollard::models::ContainerConfig;

/// The diffable part of a container or image configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub volumes: Option<BTreeSet<String>>,
    pub exposed_ports: Option<BTreeSet<String>>,
}

impl RuntimeConfig {
    pub fn from_container_config(config: &ContainerConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            cmd: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            env: config.env.clone(),
            labels: config
                .labels
                .as_ref()
                .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            volumes: config.volumes.as_ref().map(|v| v.keys().cloned().collect()),
            exposed_ports: config
                .exposed_ports
                .as_ref()
                .map(|p| p.keys().cloned().collect()),
        }
    }

    /// True when nothing would be passed to the engine.
    pub fn is_empty(&self) -> bool {
        *self == RuntimeConfig::default()
    }
}

/// `live` minus `image`, with `published_ports` forced back into the exposed
/// ports so a published port survives even when the image declares it.
pub fn diff(
    live: &RuntimeConfig,
    image: &RuntimeConfig,
    published_ports: &BTreeSet<String>,
) -> RuntimeConfig {
    let entrypoint = sequence(&live.entrypoint, &image.entrypoint);
    // An explicit entrypoint makes the engine ignore the image command, so the
    // command has to travel with it.
    let cmd = if entrypoint.is_some() {
        live.cmd.clone()
    } else {
        sequence(&live.cmd, &image.cmd)
    };

    let mut exposed_ports = key_subtract(&live.exposed_ports, &image.exposed_ports)
        .unwrap_or_default();
    exposed_ports.extend(published_ports.iter().cloned());

    RuntimeConfig {
        working_dir: scalar(&live.working_dir, &image.working_dir),
        user: scalar(&live.user, &image.user),
        cmd,
        entrypoint,
        env: entry_subtract(&live.env, &image.env),
        labels: label_subtract(&live.labels, &image.labels),
        volumes: key_subtract(&live.volumes, &image.volumes),
        exposed_ports: non_empty(exposed_ports),
    }
}

fn scalar(live: &Option<String>, image: &Option<String>) -> Option<String> {
    let live = live.as_deref().filter(|s| !s.is_empty())?;
    if image.as_deref() == Some(live) {
        None
    } else {
        Some(live.to_string())
    }
}

fn sequence(live: &Option<Vec<String>>, image: &Option<Vec<String>>) -> Option<Vec<String>> {
    let live = live.as_ref()?;
    if image.as_ref() == Some(live) {
        None
    } else {
        Some(live.clone())
    }
}

// Multiset subtraction on the exact `KEY=VALUE` string.
fn entry_subtract(live: &Option<Vec<String>>, image: &Option<Vec<String>>) -> Option<Vec<String>> {
    let live = live.as_ref()?;
    let mut inherited: HashMap<&str, usize> = HashMap::new();
    for entry in image.iter().flatten() {
        *inherited.entry(entry.as_str()).or_default() += 1;
    }
    let kept: Vec<String> = live
        .iter()
        .filter(|entry| match inherited.get_mut(entry.as_str()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .cloned()
        .collect();
    (!kept.is_empty()).then_some(kept)
}

fn label_subtract(
    live: &Option<BTreeMap<String, String>>,
    image: &Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let live = live.as_ref()?;
    let kept: BTreeMap<String, String> = live
        .iter()
        .filter(|(key, value)| image.as_ref().and_then(|i| i.get(*key)) != Some(*value))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!kept.is_empty()).then_some(kept)
}

fn key_subtract(
    live: &Option<BTreeSet<String>>,
    image: &Option<BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    let live = live.as_ref()?;
    let kept: BTreeSet<String> = match image {
        Some(image) => live.difference(image).cloned().collect(),
        None => live.clone(),
    };
    non_empty(kept)
}

fn non_empty(set: BTreeSet<String>) -> Option<BTreeSet<String>> {
    (!set.is_empty()).then_some(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn labels(items: &[(&str, &str)]) -> BTreeMap<String, String> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn image_defaults() -> RuntimeConfig {
        RuntimeConfig {
            working_dir: Some("/srv".to_string()),
            user: Some("app".to_string()),
            cmd: Some(strings(&["serve"])),
            entrypoint: Some(strings(&["/entry.sh"])),
            env: Some(strings(&["PATH=/usr/bin", "MODE=prod"])),
            labels: Some(labels(&[("maintainer", "ops"), ("tier", "web")])),
            volumes: Some(set(&["/data"])),
            exposed_ports: Some(set(&["80/tcp"])),
        }
    }

    // Engine semantics for creating a container: supplied settings layered
    // over the image's.
    fn layer(image: &RuntimeConfig, supplied: &RuntimeConfig) -> RuntimeConfig {
        let mut env: Vec<String> = image.env.clone().unwrap_or_default();
        for entry in supplied.env.iter().flatten() {
            let key = entry.split('=').next().unwrap_or_default();
            env.retain(|e| e.split('=').next().unwrap_or_default() != key);
            env.push(entry.clone());
        }
        let mut merged_labels = image.labels.clone().unwrap_or_default();
        merged_labels.extend(supplied.labels.clone().unwrap_or_default());
        let union = |a: &Option<BTreeSet<String>>, b: &Option<BTreeSet<String>>| {
            let mut s = a.clone().unwrap_or_default();
            s.extend(b.clone().unwrap_or_default());
            s
        };
        let (entrypoint, cmd) = match &supplied.entrypoint {
            Some(ep) => (Some(ep.clone()), supplied.cmd.clone()),
            None => (
                image.entrypoint.clone(),
                supplied.cmd.clone().or_else(|| image.cmd.clone()),
            ),
        };
        RuntimeConfig {
            working_dir: supplied.working_dir.clone().or_else(|| image.working_dir.clone()),
            user: supplied.user.clone().or_else(|| image.user.clone()),
            cmd,
            entrypoint,
            env: Some(env),
            labels: Some(merged_labels),
            volumes: Some(union(&image.volumes, &supplied.volumes)),
            exposed_ports: Some(union(&image.exposed_ports, &supplied.exposed_ports)),
        }
    }

    fn sorted_env(config: &RuntimeConfig) -> Vec<String> {
        let mut env = config.env.clone().unwrap_or_default();
        env.sort();
        env
    }

    #[test]
    fn test_diff_of_image_against_itself_is_empty() {
        let image = image_defaults();
        let result = diff(&image, &image, &BTreeSet::new());
        assert!(result.is_empty(), "expected empty diff, got {result:?}");
    }

    #[test]
    fn test_scalars_cleared_only_when_equal() {
        let image = image_defaults();
        let live = RuntimeConfig {
            working_dir: Some("/srv".to_string()),
            user: Some("root".to_string()),
            ..image.clone()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.working_dir, None);
        assert_eq!(result.user.as_deref(), Some("root"));
    }

    #[test]
    fn test_cmd_is_all_or_nothing() {
        let image = image_defaults();
        let live = RuntimeConfig {
            cmd: Some(strings(&["serve", "--verbose"])),
            ..image.clone()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.cmd, Some(strings(&["serve", "--verbose"])));
        assert_eq!(result.entrypoint, None);
    }

    #[test]
    fn test_overridden_entrypoint_carries_command() {
        let image = image_defaults();
        let live = RuntimeConfig {
            entrypoint: Some(strings(&["/bin/sh", "-c"])),
            ..image.clone()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.entrypoint, Some(strings(&["/bin/sh", "-c"])));
        assert_eq!(result.cmd, Some(strings(&["serve"])));
    }

    #[test]
    fn test_env_subtraction_is_by_exact_string() {
        let live = RuntimeConfig {
            env: Some(strings(&["A=1"])),
            ..Default::default()
        };
        let image = RuntimeConfig {
            env: Some(strings(&["A=2"])),
            ..Default::default()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.env, Some(strings(&["A=1"])));
    }

    #[test]
    fn test_env_subtraction_counts_duplicates() {
        let live = RuntimeConfig {
            env: Some(strings(&["A=1", "A=1", "B=2"])),
            ..Default::default()
        };
        let image = RuntimeConfig {
            env: Some(strings(&["A=1"])),
            ..Default::default()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.env, Some(strings(&["A=1", "B=2"])));
    }

    #[test]
    fn test_labels_keep_new_and_changed_keys() {
        let image = image_defaults();
        let live = RuntimeConfig {
            labels: Some(labels(&[
                ("maintainer", "ops"),
                ("tier", "api"),
                ("com.docker.compose.service", "web"),
            ])),
            ..image.clone()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(
            result.labels,
            Some(labels(&[("com.docker.compose.service", "web"), ("tier", "api")]))
        );
    }

    #[test]
    fn test_volumes_are_key_sets() {
        let image = image_defaults();
        let live = RuntimeConfig {
            volumes: Some(set(&["/data", "/cache"])),
            ..image.clone()
        };
        let result = diff(&live, &image, &BTreeSet::new());
        assert_eq!(result.volumes, Some(set(&["/cache"])));
    }

    #[test]
    fn test_published_port_survives_image_default() {
        let image = image_defaults();
        let live = RuntimeConfig {
            exposed_ports: Some(set(&["80/tcp", "9000/tcp"])),
            ..image.clone()
        };
        let published = set(&["80/tcp"]);
        let result = diff(&live, &image, &published);
        assert_eq!(result.exposed_ports, Some(set(&["80/tcp", "9000/tcp"])));
    }

    #[test]
    fn test_absent_image_fields_preserve_live_values() {
        let live = image_defaults();
        let result = diff(&live, &RuntimeConfig::default(), &BTreeSet::new());
        assert_eq!(result, live);
    }

    #[test]
    fn test_layering_diff_over_image_reproduces_live() {
        let image = image_defaults();
        let cases = vec![
            RuntimeConfig {
                env: Some(strings(&["PATH=/usr/bin", "MODE=dev", "EXTRA=1"])),
                user: Some("root".to_string()),
                ..image.clone()
            },
            RuntimeConfig {
                entrypoint: Some(strings(&["/bin/sh"])),
                labels: Some(labels(&[("maintainer", "ops"), ("tier", "web"), ("x", "y")])),
                exposed_ports: Some(set(&["80/tcp", "443/tcp"])),
                ..image.clone()
            },
            RuntimeConfig {
                cmd: Some(strings(&["worker"])),
                volumes: Some(set(&["/data", "/scratch"])),
                working_dir: Some("/tmp".to_string()),
                ..image.clone()
            },
            image.clone(),
        ];

        for live in cases {
            let rebuilt = layer(&image, &diff(&live, &image, &set(&["80/tcp"])));
            assert_eq!(rebuilt.working_dir, live.working_dir);
            assert_eq!(rebuilt.user, live.user);
            assert_eq!(rebuilt.cmd, live.cmd);
            assert_eq!(rebuilt.entrypoint, live.entrypoint);
            assert_eq!(sorted_env(&rebuilt), sorted_env(&live));
            assert_eq!(rebuilt.labels, live.labels);
            assert_eq!(rebuilt.volumes, live.volumes);
            assert_eq!(rebuilt.exposed_ports, live.exposed_ports);
        }
    }
}
