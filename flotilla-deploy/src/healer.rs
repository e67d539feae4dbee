//! Leader-elected healer: every node runs this loop, the lowest healthy IP
//! acts.
//!
//! Leadership is only a heuristic to avoid duplicate work; correctness comes
//! from the infrastructure lock. Two nodes that briefly both believe they
//! lead serialize through the lock, and the second finds the work done.

use crate::deployer::Deployer;
use chrono::{DateTime, Utc};
use flotilla_core::config::FlotillaConfig;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::metrics::{MetricKey, MetricsRing};
use flotilla_core::ops::{CommandRunner, NodeAgent, Notifier};
use flotilla_core::state::StateIndex;
use flotilla_core::types::{Capacity, DeploymentRecord, DeploymentStatus, MetricSample, Node, ServiceId};
use flotilla_infra::{InventoryStore, LockManager};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MAX_REPLACEMENT_ATTEMPTS: u32 = 3;
const PING_TIMEOUT_SECS: u32 = 5;
const HISTORY_LIMIT: usize = 100;

/// One replacement attempt, kept for operators to inspect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplacementRecord {
    pub at: DateTime<Utc>,
    pub failed_ip: String,
    pub replacement_ip: Option<String>,
    pub success: bool,
    pub detail: String,
    pub actor: String,
}

pub struct Healer {
    my_ip: String,
    config: Arc<RwLock<FlotillaConfig>>,
    inventory: Arc<InventoryStore>,
    state: Arc<StateIndex>,
    agent: Arc<dyn NodeAgent>,
    lock: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
    runner: Arc<dyn CommandRunner>,
    deployer: Arc<Deployer>,
    metrics: Arc<MetricsRing>,
    history_path: PathBuf,
    min_healthy: usize,
}

impl Healer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        my_ip: &str,
        config: Arc<RwLock<FlotillaConfig>>,
        inventory: Arc<InventoryStore>,
        state: Arc<StateIndex>,
        agent: Arc<dyn NodeAgent>,
        lock: Arc<LockManager>,
        notifier: Arc<dyn Notifier>,
        runner: Arc<dyn CommandRunner>,
        deployer: Arc<Deployer>,
        metrics: Arc<MetricsRing>,
        history_path: PathBuf,
        min_healthy: usize,
    ) -> Self {
        Self {
            my_ip: my_ip.to_string(),
            config,
            inventory,
            state,
            agent,
            lock,
            notifier,
            runner,
            deployer,
            metrics,
            history_path,
            min_healthy,
        }
    }

    /// One monitoring cycle. Every node collects metrics and checks health;
    /// only the leader mutates topology. Returns whether this node acted as
    /// the leader, so the caller knows to run leader-only work after.
    pub async fn run_cycle(&self) -> FlotillaResult<bool> {
        self.log_local_utilization();
        self.collect_metrics().await;

        if let Err(e) = self.inventory.reconcile().await {
            warn!("could not reconcile inventory, skipping cycle: {}", e);
            return Ok(false);
        }

        let greens = self.inventory.by_status(DeploymentStatus::Green).await;
        if greens.is_empty() {
            debug!("no green nodes to monitor");
            return Ok(false);
        }

        let mut healthy = Vec::new();
        let mut failed = Vec::new();
        for node in greens {
            if self.is_node_healthy(&node).await {
                healthy.push(node);
            } else {
                failed.push(node);
            }
        }
        info!(
            "health check: {} healthy, {} failed",
            healthy.len(),
            failed.len()
        );

        if healthy.is_empty() {
            self.notifier
                .send(
                    "CRITICAL: all green nodes down",
                    "Every green node failed its health check. No replacements \
                     will run; immediate manual intervention required.",
                )
                .await;
            return Ok(false);
        }

        let leader_ip = healthy
            .iter()
            .map(|n| n.public_ip.as_str())
            .min()
            .unwrap_or_default()
            .to_string();
        if self.my_ip != leader_ip {
            debug!("follower ({}), leader is {}", self.my_ip, leader_ip);
            return Ok(false);
        }
        info!("acting as leader ({})", self.my_ip);

        if failed.is_empty() {
            return Ok(true);
        }

        if healthy.len() <= self.min_healthy {
            self.notifier
                .send(
                    "cannot replace failed nodes",
                    &format!(
                        "Failed nodes: {:?}, but only {} healthy node(s) remain \
                         (floor {}). Not replacing, to avoid a replacement storm \
                         during a wider outage.",
                        failed.iter().map(|n| n.public_ip.clone()).collect::<Vec<_>>(),
                        healthy.len(),
                        self.min_healthy
                    ),
                )
                .await;
            return Ok(true);
        }

        match self.lock.acquire(&self.my_ip).await {
            Ok(()) => {}
            Err(FlotillaError::LockHeld { holder }) => {
                info!("infrastructure lock held by {}, backing off", holder);
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        // strictly sequential; parallel replacement risks interleaved state
        for node in &failed {
            info!("replacing failed node {}", node.public_ip);
            if !self.replace_node(node).await {
                warn!("replacement of {} failed terminally, stopping", node.public_ip);
                break;
            }
        }

        self.lock.release(&self.my_ip).await;
        Ok(true)
    }

    fn log_local_utilization(&self) {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        let mem_percent = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        debug!(
            "local node: cpu {:.1}%, mem {:.1}%",
            system.global_cpu_info().cpu_usage(),
            mem_percent
        );
    }

    /// Sample every deployed container into the metrics rings. All nodes
    /// collect; only the leader's scaler consumes.
    async fn collect_metrics(&self) {
        for record in self.state.all_current().await {
            for ip in &record.node_ips {
                match self.agent.container_status(ip, &record.container_name).await {
                    Ok(status) => {
                        let sample = MetricSample {
                            at: Utc::now(),
                            cpu_percent: status.cpu_percent,
                            memory_percent: status.memory_percent,
                            requests_per_second: status.requests_per_second,
                        };
                        self.metrics
                            .sample(MetricKey::new(ip, &record.service), sample)
                            .await;
                    }
                    Err(e) => debug!("no stats for {} on {}: {}", record.service, ip, e),
                }
            }
        }
    }

    /// Three-part green health check: L3 reachability, runtime liveness,
    /// and presence of every container the state index expects.
    async fn is_node_healthy(&self, node: &Node) -> bool {
        let ip = &node.public_ip;

        let ping = format!("ping -c 1 -W {} {}", PING_TIMEOUT_SECS, ip);
        if self.runner.run("localhost", &ping).await.is_err() {
            info!("{} failed ping", ip);
            return false;
        }

        if !self.agent.runtime_alive(ip).await {
            info!("{} runtime/agent not answering", ip);
            return false;
        }

        let expected = self.state.services_on_node(ip).await;
        if expected.is_empty() {
            return true;
        }
        let running = match self.agent.list_containers(ip).await {
            Ok(containers) => containers,
            Err(e) => {
                info!("{} cannot list containers: {}", ip, e);
                return false;
            }
        };
        for record in &expected {
            if !running.contains(&record.container_name) {
                info!(
                    "{} missing container {} ({})",
                    ip, record.container_name, record.service
                );
                return false;
            }
        }
        true
    }

    /// Replace one failed node: fresh capacity, redeploy everything the
    /// state index says lived there, verify, swap, destroy the corpse.
    /// Up to three attempts; a failed attempt destroys its replacement.
    async fn replace_node(&self, failed: &Node) -> bool {
        let hosted = self.state.services_on_node(&failed.public_ip).await;
        if hosted.is_empty() {
            info!("{} hosted no recorded services", failed.public_ip);
        } else {
            info!(
                "{} hosted {} service(s): {:?}",
                failed.public_ip,
                hosted.len(),
                hosted.iter().map(|r| r.service.to_string()).collect::<Vec<_>>()
            );
        }
        let capacity = Capacity {
            zone: failed.zone.clone(),
            vcpu: failed.vcpu,
            memory_mib: failed.memory_mib,
        };

        for attempt in 1..=MAX_REPLACEMENT_ATTEMPTS {
            info!(
                "replacement attempt {}/{} for {}",
                attempt, MAX_REPLACEMENT_ATTEMPTS, failed.public_ip
            );
            match self.try_replacement(failed, &hosted, &capacity).await {
                Ok(new_ip) => {
                    self.record_attempt(&failed.public_ip, Some(&new_ip), true, "replaced")
                        .await;
                    self.notifier
                        .send(
                            "node replacement succeeded",
                            &format!(
                                "Failed node {} replaced by {}.\nServices redeployed: {}.",
                                failed.public_ip,
                                new_ip,
                                hosted.len()
                            ),
                        )
                        .await;
                    return true;
                }
                Err(e) => warn!(
                    "attempt {} for {} failed: {}",
                    attempt, failed.public_ip, e
                ),
            }
        }

        // terminal: the failed node stays in place for a human to inspect
        self.record_attempt(
            &failed.public_ip,
            None,
            false,
            &format!("gave up after {} attempts", MAX_REPLACEMENT_ATTEMPTS),
        )
        .await;
        self.notifier
            .send(
                "node replacement FAILED",
                &format!(
                    "Could not replace {} after {} attempts. Services affected: {}. \
                     The node was left in place for inspection; manual intervention required.",
                    failed.public_ip,
                    MAX_REPLACEMENT_ATTEMPTS,
                    hosted.len()
                ),
            )
            .await;
        false
    }

    async fn try_replacement(
        &self,
        failed: &Node,
        hosted: &[DeploymentRecord],
        capacity: &Capacity,
    ) -> FlotillaResult<String> {
        let claimed = self.inventory.claim(1, capacity).await?;
        let new_ip = claimed[0].clone();
        info!("replacement candidate for {} is {}", failed.public_ip, new_ip);

        let outcome = self.rebuild_on(&new_ip, hosted).await;
        if let Err(e) = outcome {
            if let Err(destroy_err) = self.inventory.release(&[new_ip.clone()], true).await {
                warn!("could not destroy failed replacement {}: {}", new_ip, destroy_err);
            }
            return Err(e);
        }

        let services: Vec<ServiceId> = hosted.iter().map(|r| r.service.clone()).collect();
        self.inventory.adopt_as_green(&new_ip, &services).await?;
        self.state.swap_node(&failed.public_ip, &new_ip).await?;
        self.inventory
            .release(&[failed.public_ip.clone()], true)
            .await?;
        Ok(new_ip)
    }

    async fn rebuild_on(&self, new_ip: &str, hosted: &[DeploymentRecord]) -> FlotillaResult<()> {
        for record in hosted {
            let id = &record.service;
            let spec = {
                let config = self.config.read().await;
                match config.service_spec(&id.project, &id.env, &id.service) {
                    Ok(spec) => spec.clone(),
                    Err(e) => {
                        warn!("no spec for {} anymore, skipping: {}", id, e);
                        continue;
                    }
                }
            };
            self.deployer
                .redeploy_on_node(id, &spec, &record.version, new_ip)
                .await?;
        }

        if !self.agent.runtime_alive(new_ip).await {
            return Err(FlotillaError::Agent(format!(
                "replacement {} not answering after redeploy",
                new_ip
            )));
        }
        Ok(())
    }

    async fn record_attempt(
        &self,
        failed_ip: &str,
        replacement_ip: Option<&str>,
        success: bool,
        detail: &str,
    ) {
        let mut history: Vec<ReplacementRecord> =
            match tokio::fs::read_to_string(&self.history_path).await {
                Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
                Err(_) => Vec::new(),
            };
        history.push(ReplacementRecord {
            at: Utc::now(),
            failed_ip: failed_ip.to_string(),
            replacement_ip: replacement_ip.map(str::to_string),
            success,
            detail: detail.to_string(),
            actor: self.my_ip.clone(),
        });
        let start = history.len().saturating_sub(HISTORY_LIMIT);
        let trimmed = &history[start..];

        if let Some(parent) = self.history_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_string_pretty(trimmed) {
            Ok(content) => {
                if let Err(e) = tokio::fs::write(&self.history_path, content).await {
                    warn!("could not persist replacement history: {}", e);
                }
            }
            Err(e) => warn!("could not serialize replacement history: {}", e),
        }
    }
}
