//! Link notation translation.
//!
//! Inspection reports links as `/<target>:/<source>/<alias>`; creation
//! expects `<target>:<alias>`.

use bollard::models::HostConfig;
use relaunch_common::UpdateError;

/// The name is the target path's last segment, the alias whatever follows
/// the last `/` of the alias path.
pub fn rewrite_link(link: &str) -> Result<String, UpdateError> {
    let malformed = || UpdateError::MalformedLink(link.to_string());

    let (target, alias_path) = link.split_once(':').ok_or_else(malformed)?;
    let name = target.rsplit('/').next().unwrap_or_default();
    let (_, alias) = alias_path.rsplit_once('/').ok_or_else(malformed)?;
    if name.is_empty() || alias.is_empty() {
        return Err(malformed());
    }
    Ok(format!("{name}:{alias}"))
}

/// Returns the host config with every link rewritten. Any malformed link
/// rejects the whole config.
pub fn rewrite_links(mut host_config: HostConfig) -> Result<HostConfig, UpdateError> {
    if let Some(links) = host_config.links.take() {
        let rewritten = links
            .iter()
            .map(|l| rewrite_link(l))
            .collect::<Result<Vec<_>, _>>()?;
        host_config.links = Some(rewritten);
    }
    Ok(host_config)
}
