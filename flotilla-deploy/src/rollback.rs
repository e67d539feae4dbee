//! Rollback: redeploy an older version from the service's history.
//!
//! A rollback is an ordinary deploy with `build = false` and a pinned
//! version; the blue/green machinery does the rest. The only extra step is a
//! registry probe, because rebuilding a missing image would defeat the point.

use crate::deployer::{DeploySummary, Deployer};
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::naming;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort "does this tag exist" check against a Docker-Hub-shaped
/// registry API.
pub struct RegistryProbe {
    http: Client,
    base: String,
}

impl Default for RegistryProbe {
    fn default() -> Self {
        Self::new("https://hub.docker.com/v2")
    }
}

impl RegistryProbe {
    pub fn new(base: &str) -> Self {
        Self {
            http: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn image_exists(&self, account: &str, repository: &str, tag: &str) -> bool {
        let url = format!(
            "{}/repositories/{}/{}/tags/{}/",
            self.base, account, repository, tag
        );
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("registry probe for {}/{}:{} failed: {}", account, repository, tag, e);
                false
            }
        }
    }
}

/// Roll a service back to `target_version`, or to the version before the
/// current one when unset. Aborts cleanly when the image is gone from the
/// registry or the history is too shallow.
pub async fn rollback(
    deployer: &Deployer,
    probe: &RegistryProbe,
    project: &str,
    env: &str,
    service: &str,
    target_version: Option<&str>,
) -> FlotillaResult<DeploySummary> {
    let id = deployer.service_id(project, env, service).await;
    let state = deployer.state_index();

    let target = match target_version {
        Some(version) => version.to_string(),
        None => state.previous_version(&id).await.ok_or_else(|| {
            FlotillaError::Validation(format!(
                "{} has no previous version to roll back to",
                id
            ))
        })?,
    };

    let history = state.version_history(&id).await;
    if !history.iter().any(|v| v == &target) {
        return Err(FlotillaError::Validation(format!(
            "version '{}' is not in {}'s history (known: {:?})",
            target, id, history
        )));
    }

    let account = deployer.registry_account().await;
    let repository = naming::image_repository(project, env, service);
    if !probe.image_exists(&account, &repository, &target).await {
        return Err(FlotillaError::MissingImage(format!(
            "{}/{}:{}",
            account, repository, target
        )));
    }

    info!("rolling back {} to {}", id, target);
    deployer
        .deploy(project, env, Some(service), false, Some(&target))
        .await
}
