//! Immutable blue/green deployer.
//!
//! Every deploy claims fresh blue nodes, prepares them, health-gates them,
//! and only then swaps generations. Greens are never mutated in place; a
//! failed gate releases the blues and leaves production untouched.

use chrono::Utc;
use flotilla_core::config::FlotillaConfig;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::{Gateway, ImageBuilder, NodeAgent, RunSpec};
use flotilla_core::paths::{self, TargetOs};
use flotilla_core::state::StateIndex;
use flotilla_core::types::{
    DeploymentRecord, ImageSource, RunMode, ServiceId, ServiceSpec,
};
use flotilla_core::naming;
use flotilla_infra::agent::push_payload;
use flotilla_infra::{InventoryStore, LockManager};
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::schedule::ScheduledJobInstaller;

const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_GATE_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Succeeded,
    Failed,
}

/// What a CLI invocation reports back.
#[derive(Clone, Debug, Serialize)]
pub struct DeploySummary {
    pub status: DeployStatus,
    pub deployed_services: Vec<String>,
    pub failed_services: Vec<String>,
    pub error: Option<String>,
}

impl DeploySummary {
    pub fn succeeded(&self) -> bool {
        self.status == DeployStatus::Succeeded
    }
}

pub struct Deployer {
    config: Arc<RwLock<FlotillaConfig>>,
    inventory: Arc<InventoryStore>,
    state: Arc<StateIndex>,
    agent: Arc<dyn NodeAgent>,
    lock: Arc<LockManager>,
    installer: Arc<ScheduledJobInstaller>,
    builder: Option<Arc<dyn ImageBuilder>>,
    gateway: Option<Arc<dyn Gateway>>,
    http: Client,
    /// Identity written into deployment records and held on the lock
    actor: String,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<FlotillaConfig>>,
        inventory: Arc<InventoryStore>,
        state: Arc<StateIndex>,
        agent: Arc<dyn NodeAgent>,
        lock: Arc<LockManager>,
        installer: Arc<ScheduledJobInstaller>,
        builder: Option<Arc<dyn ImageBuilder>>,
        gateway: Option<Arc<dyn Gateway>>,
        actor: &str,
    ) -> Self {
        Self {
            config,
            inventory,
            state,
            agent,
            lock,
            installer,
            builder,
            gateway,
            http: Client::new(),
            actor: actor.to_string(),
        }
    }

    pub fn state_index(&self) -> Arc<StateIndex> {
        self.state.clone()
    }

    pub async fn registry_account(&self) -> String {
        self.config.read().await.registry_account.clone()
    }

    pub async fn service_id(&self, project: &str, env: &str, service: &str) -> ServiceId {
        self.config.read().await.service_id(project, env, service)
    }

    fn image_for(
        &self,
        registry_account: &str,
        id: &ServiceId,
        spec: &ServiceSpec,
        version: &str,
    ) -> String {
        match &spec.image {
            ImageSource::Registry(image) => image.clone(),
            _ => naming::image_ref(registry_account, &id.project, &id.env, &id.service, version),
        }
    }

    /// Deploy a project environment: every service in startup order, or just
    /// one when `service_filter` is set. `target_version` pins the image tag
    /// (rollback path); `build` produces and pushes images first.
    pub async fn deploy(
        &self,
        project: &str,
        env: &str,
        service_filter: Option<&str>,
        build: bool,
        target_version: Option<&str>,
    ) -> FlotillaResult<DeploySummary> {
        let (services, version, registry_account, user) = {
            let config = self.config.read().await;
            let services = config.services(project, env)?.clone();
            let version = target_version
                .map(str::to_string)
                .unwrap_or_else(|| config.projects[project].version.clone());
            (
                services,
                version,
                config.registry_account.clone(),
                config.user.clone(),
            )
        };

        let mut ordered = startup_order(&services)?;
        if let Some(filter) = service_filter {
            if !ordered.iter().any(|s| s == filter) {
                return Err(FlotillaError::NoSuchService(format!(
                    "{}/{}/{}",
                    project, env, filter
                )));
            }
            ordered.retain(|s| s == filter);
        }

        info!(
            "deploying {}/{} ({} service(s), version {})",
            project,
            env,
            ordered.len(),
            version
        );

        let mut summary = DeploySummary {
            status: DeployStatus::Succeeded,
            deployed_services: Vec::new(),
            failed_services: Vec::new(),
            error: None,
        };

        for name in ordered {
            let spec = &services[&name];
            let id = ServiceId::new(&user, project, env, &name);
            let result = self
                .deploy_service(&id, spec, &registry_account, &version, build)
                .await;
            match result {
                Ok(()) => summary.deployed_services.push(name),
                Err(e) => {
                    error!("deployment of {} failed: {}", id, e);
                    summary.failed_services.push(name);
                    summary.status = DeployStatus::Failed;
                    summary.error = Some(e.to_string());
                    // services later in the startup order depend on this one
                    break;
                }
            }
        }

        Ok(summary)
    }

    async fn deploy_service(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        registry_account: &str,
        version: &str,
        build: bool,
    ) -> FlotillaResult<()> {
        let image = self.image_for(registry_account, id, spec, version);

        if build && spec.image.needs_build() {
            let builder = self.builder.as_ref().ok_or_else(|| {
                FlotillaError::Config("no image builder configured for a built service".into())
            })?;
            builder.build(&spec.image, &image).await?;
            // every target node is remote, so built images always go to the registry
            builder.push(&image).await?;
        }

        match &spec.run_mode {
            RunMode::Scheduled(_) => self.deploy_scheduled(id, spec, &image).await,
            RunMode::LongRunning => self.deploy_immutable(id, spec, &image, version).await,
        }
    }

    /// Scheduled services are host scheduler entries, not blue/green fleets:
    /// find (or claim) one matching green node and install the entry there.
    async fn deploy_scheduled(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
    ) -> FlotillaResult<()> {
        let zone = spec.zones.first().ok_or_else(|| {
            FlotillaError::Validation(format!("{} declares no zones", id))
        })?;
        let capacity = spec.capacity_in(zone);

        self.inventory.reconcile().await?;
        let host = match self
            .inventory
            .by_status(flotilla_core::types::DeploymentStatus::Green)
            .await
            .into_iter()
            .find(|n| n.matches(&capacity))
        {
            Some(node) => node.public_ip,
            None => {
                let ips = self.inventory.claim(1, &capacity).await?;
                self.inventory.promote(&ips, id).await?;
                ips[0].clone()
            }
        };

        self.installer.install(id, spec, image, &host).await
    }

    /// The blue/green core: claim → prepare → gate → promote or roll back.
    async fn deploy_immutable(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        version: &str,
    ) -> FlotillaResult<()> {
        info!("immutable deployment of {} ({})", id, image);

        // one pipeline per zone, claims and preparation in parallel
        let pipelines = join_all(
            spec.zones
                .iter()
                .map(|zone| self.prepare_zone(id, spec, image, zone)),
        )
        .await;

        let mut all_blues = Vec::new();
        let mut failed_ips = Vec::new();
        let mut first_error = None;
        for result in pipelines {
            match result {
                Ok(blues) => all_blues.extend(blues),
                Err((blues, failed, err)) => {
                    all_blues.extend(blues);
                    failed_ips.extend(failed);
                    first_error = first_error.or(Some(err));
                }
            }
        }

        if let Some(err) = first_error {
            // stop and remove whatever started, hand every blue back, leave
            // the greens alone
            warn!("{}: rolling back blues {:?}", id, all_blues);
            let container = naming::container_name(&id.user, &id.project, &id.env, &id.service);
            for ip in &all_blues {
                if let Err(e) = self.agent.stop_container(ip, &container, true).await {
                    warn!("cleanup stop on {}: {}", ip, e);
                }
                if let Err(e) = self.agent.remove_container(ip, &container, true).await {
                    warn!("cleanup remove on {}: {}", ip, e);
                }
            }
            if let Err(e) = self.inventory.release(&all_blues, false).await {
                warn!("releasing blues after failed gate: {}", e);
            }
            return match err {
                FlotillaError::HealthGate { .. } => Err(FlotillaError::HealthGate {
                    service: id.to_string(),
                    failed_ips,
                }),
                other => Err(other),
            };
        }

        // promotion is serialized across the fleet through the infrastructure
        // lock; contention surfaces to the caller for a later retry
        self.lock.acquire(&self.actor).await?;
        let promoted = self.inventory.promote(&all_blues, id).await;
        self.lock.release(&self.actor).await;
        let old_greens = promoted?;

        let record = DeploymentRecord {
            service: id.clone(),
            version: version.to_string(),
            node_ips: all_blues.clone(),
            container_name: naming::container_name(&id.user, &id.project, &id.env, &id.service),
            deployed_at: Utc::now(),
            actor: self.actor.clone(),
        };
        self.state.record_deployment(record).await?;

        if let (Some(gateway), Some(domain)) = (&self.gateway, &spec.domain) {
            if let Err(e) = gateway.update_backends(id, domain, &all_blues).await {
                warn!("gateway update for {} failed: {}", id, e);
            }
        }

        if !old_greens.is_empty() {
            self.inventory
                .release(&old_greens, !spec.keep_reserve)
                .await?;
        }

        info!("{} now green on {:?}", id, all_blues);
        Ok(())
    }

    /// Claim and fully prepare one zone's blues. On failure the caller gets
    /// every claimed IP back for cleanup, plus the IPs that failed the gate.
    async fn prepare_zone(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        zone: &str,
    ) -> Result<Vec<String>, (Vec<String>, Vec<String>, FlotillaError)> {
        let capacity = spec.capacity_in(zone);
        let blues = self
            .inventory
            .claim(spec.replicas as usize, &capacity)
            .await
            .map_err(|e| (Vec::new(), Vec::new(), e))?;

        match self.prepare_nodes(id, spec, image, &blues).await {
            Ok(()) => Ok(blues),
            Err((failed, err)) => Err((blues, failed, err)),
        }
    }

    async fn prepare_nodes(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        blues: &[String],
    ) -> Result<(), (Vec<String>, FlotillaError)> {
        // idempotent pre-deploy payload push
        let local_root = self.local_payload_root(id);
        let extract_path = paths::payload_root(TargetOs::Linux, &id.user, &id.project, &id.env);
        for ip in blues {
            if let Err(e) = push_payload(self.agent.as_ref(), ip, &local_root, &extract_path).await
            {
                return Err((vec![ip.clone()], e));
            }
        }

        // one pipeline per node; no concurrent agent calls for one container
        let results = join_all(blues.iter().map(|ip| self.deploy_on_blue(id, spec, image, ip))).await;
        let mut failed = Vec::new();
        let mut first_error = None;
        for (ip, result) in blues.iter().zip(results) {
            if let Err(e) = result {
                failed.push(ip.clone());
                first_error = first_error.or(Some(e));
            }
        }
        if let Some(err) = first_error {
            return Err((failed, err));
        }

        // the health gate waits for every node in the zone
        let mut unhealthy = Vec::new();
        for ip in blues {
            if !self.health_gate(id, spec, ip).await {
                unhealthy.push(ip.clone());
            }
        }
        if !unhealthy.is_empty() {
            return Err((
                unhealthy.clone(),
                FlotillaError::HealthGate {
                    service: id.to_string(),
                    failed_ips: unhealthy,
                },
            ));
        }
        Ok(())
    }

    fn local_payload_root(&self, id: &ServiceId) -> PathBuf {
        let os = if cfg!(windows) {
            TargetOs::Windows
        } else {
            TargetOs::Linux
        };
        PathBuf::from(paths::payload_root(os, &id.user, &id.project, &id.env))
    }

    async fn deploy_on_blue(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        ip: &str,
    ) -> FlotillaResult<()> {
        let network = naming::network_name(&id.project, &id.env);
        self.agent.ensure_network(ip, &network).await?;

        for volume in paths::required_volumes(&id.user, &id.project, &id.env, &id.service) {
            self.agent.ensure_volume(ip, &volume).await?;
        }

        self.agent.pull_image(ip, image).await?;

        let spec_run = RunSpec {
            name: naming::container_name(&id.user, &id.project, &id.env, &id.service),
            image: image.to_string(),
            ports: spec
                .ports
                .iter()
                .map(|p| (p.to_string(), p.to_string()))
                .collect::<HashMap<_, _>>(),
            volumes: paths::all_mounts(TargetOs::Linux, &id.user, &id.project, &id.env, &id.service),
            env_vars: spec.env_vars.clone(),
            network: Some(network),
            restart_policy: if spec.restart {
                "unless-stopped".to_string()
            } else {
                "no".to_string()
            },
            command: spec.command.clone(),
        };
        self.agent.run_container(ip, &spec_run).await
    }

    /// Post-start checks a blue must pass before promotion: HTTP 2xx within
    /// 30 s for services with a published port, a running container for the
    /// rest.
    async fn health_gate(&self, id: &ServiceId, spec: &ServiceSpec, ip: &str) -> bool {
        if spec.wants_http_gate(&id.service) {
            let url = format!("http://{}:{}/", ip, spec.ports[0]);
            let deadline = tokio::time::Instant::now() + HEALTH_GATE_TIMEOUT;
            loop {
                let probe = self
                    .http
                    .get(&url)
                    .timeout(HEALTH_PROBE_TIMEOUT)
                    .send()
                    .await;
                if let Ok(resp) = probe {
                    if resp.status().is_success() {
                        return true;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("{}: no 2xx from {} within {:?}", id, url, HEALTH_GATE_TIMEOUT);
                    return false;
                }
                tokio::time::sleep(HEALTH_GATE_INTERVAL).await;
            }
        } else {
            let container = naming::container_name(&id.user, &id.project, &id.env, &id.service);
            match self.agent.container_status(ip, &container).await {
                Ok(status) if status.is_running() => true,
                Ok(status) => {
                    warn!("{}: container on {} is '{}'", id, ip, status.state);
                    false
                }
                Err(e) => {
                    warn!("{}: status check on {} failed: {}", id, ip, e);
                    false
                }
            }
        }
    }

    /// Rebuild one service on one specific node: the healer's entry point
    /// when it swaps a failed green for a fresh replacement.
    pub async fn redeploy_on_node(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        version: &str,
        ip: &str,
    ) -> FlotillaResult<()> {
        let registry_account = self.registry_account().await;
        let image = self.image_for(&registry_account, id, spec, version);

        let local_root = self.local_payload_root(id);
        let extract_path = paths::payload_root(TargetOs::Linux, &id.user, &id.project, &id.env);
        push_payload(self.agent.as_ref(), ip, &local_root, &extract_path).await?;

        self.deploy_on_blue(id, spec, &image, ip).await?;
        if !self.health_gate(id, spec, ip).await {
            return Err(FlotillaError::HealthGate {
                service: id.to_string(),
                failed_ips: vec![ip.to_string()],
            });
        }
        Ok(())
    }
}

/// Order services by dependency topology; ties break by `startup_order`,
/// then name. A dependency cycle is a configuration error.
pub fn startup_order(services: &HashMap<String, ServiceSpec>) -> FlotillaResult<Vec<String>> {
    let mut indegree: HashMap<&str, usize> = services
        .iter()
        .map(|(name, spec)| (name.as_str(), spec.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, spec) in services {
        for dep in &spec.depends_on {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ordered = Vec::with_capacity(services.len());
    while ordered.len() < services.len() {
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(name, deg)| **deg == 0 && !ordered.contains(&name.to_string()))
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(FlotillaError::Validation(format!(
                "dependency cycle among services: {:?}",
                stuck
            )));
        }
        ready.sort_by_key(|name| (services[*name].startup_order, name.to_string()));
        let next = ready[0];
        ordered.push(next.to_string());
        indegree.insert(next, usize::MAX); // consumed
        if let Some(children) = dependents.get(next) {
            for child in children {
                if let Some(deg) = indegree.get_mut(child) {
                    if *deg != usize::MAX {
                        *deg -= 1;
                    }
                }
            }
        }
    }
    Ok(ordered)
}
