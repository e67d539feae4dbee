//! Auto-scaling: vertical (tier steps) and horizontal (replica steps).
//!
//! Decisions are pure functions over windowed metric averages; the
//! coordinator owns cooldowns, the per-service check interval, mutual
//! exclusion with the healer, and execution through the deployer.

use crate::deployer::Deployer;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flotilla_core::config::FlotillaConfig;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::metrics::MetricsRing;
use flotilla_core::tiers::{self, TierDirection};
use flotilla_core::types::{AutoScalePolicy, MetricAverages, ScaleThresholds, ServiceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const MIN_REPLICAS: u32 = 1;
pub const MAX_REPLICAS: u32 = 20;

/// Seconds before another action in the same direction may run.
pub const SCALE_UP_COOLDOWN_SECS: i64 = 300;
pub const SCALE_DOWN_COOLDOWN_SECS: i64 = 600;

/// Averaging window for stable decisions, in minutes.
pub const METRICS_WINDOW_MINUTES: i64 = 10;

/// Per-service evaluation cadence.
pub const CHECK_INTERVAL_SECS: i64 = 300;

/// Readings below this are treated as a metrics glitch, never a reason to
/// shed capacity.
pub const RPS_GLITCH_FLOOR: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    Vertical,
    Horizontal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn cooldown_secs(&self) -> i64 {
        match self {
            Direction::Up => SCALE_UP_COOLDOWN_SECS,
            Direction::Down => SCALE_DOWN_COOLDOWN_SECS,
        }
    }
}

/// Vertical verdict: scale up when either resource is hot, down only when
/// both are cold, always exactly one tier step.
pub fn vertical_decision(
    vcpu: u32,
    memory_mib: u32,
    avg: &MetricAverages,
    thresholds: &ScaleThresholds,
) -> Option<(Direction, (u32, u32))> {
    if avg.cpu_percent > thresholds.cpu_up || avg.memory_percent > thresholds.mem_up {
        tiers::next_tier(vcpu, memory_mib, TierDirection::Up)
            .map(|tier| (Direction::Up, tier))
    } else if avg.cpu_percent < thresholds.cpu_down && avg.memory_percent < thresholds.mem_down {
        tiers::next_tier(vcpu, memory_mib, TierDirection::Down)
            .map(|tier| (Direction::Down, tier))
    } else {
        None
    }
}

/// Horizontal verdict: one replica at a time, bounded, with the near-zero
/// RPS guard against shedding capacity on bad data.
pub fn horizontal_decision(
    replicas: u32,
    avg: &MetricAverages,
    thresholds: &ScaleThresholds,
) -> Option<(Direction, u32)> {
    if avg.requests_per_second > thresholds.rps_up {
        (replicas < MAX_REPLICAS).then(|| (Direction::Up, replicas + 1))
    } else if avg.requests_per_second < thresholds.rps_down {
        if replicas <= MIN_REPLICAS {
            return None;
        }
        if avg.requests_per_second < RPS_GLITCH_FLOOR {
            debug!(
                "rps {:.3} suspiciously low, treating as metrics glitch",
                avg.requests_per_second
            );
            return None;
        }
        Some((Direction::Down, replicas - 1))
    } else {
        None
    }
}

/// Timestamps of executed actions, keyed `(service, axis, direction)`.
#[derive(Default)]
pub struct CooldownBook {
    last_action: HashMap<(ServiceId, Axis, Direction), DateTime<Utc>>,
}

impl CooldownBook {
    /// An axis is scalable when neither of its directions is cooling down.
    pub fn can_scale(&self, id: &ServiceId, axis: Axis) -> bool {
        let now = Utc::now();
        for direction in [Direction::Up, Direction::Down] {
            if let Some(at) = self.last_action.get(&(id.clone(), axis, direction)) {
                let elapsed = (now - *at).num_seconds();
                if elapsed < direction.cooldown_secs() {
                    debug!(
                        "{:?}/{:?} for {} cooling down ({}s remaining)",
                        axis,
                        direction,
                        id,
                        direction.cooldown_secs() - elapsed
                    );
                    return false;
                }
            }
        }
        true
    }

    pub fn record(&mut self, id: &ServiceId, axis: Axis, direction: Direction) {
        self.last_action
            .insert((id.clone(), axis, direction), Utc::now());
    }

    #[cfg(test)]
    fn backdate(&mut self, id: &ServiceId, axis: Axis, direction: Direction, secs_ago: i64) {
        self.last_action.insert(
            (id.clone(), axis, direction),
            Utc::now() - ChronoDuration::seconds(secs_ago),
        );
    }
}

/// Periodic evaluator driving the deployer from windowed metrics.
pub struct ScalingCoordinator {
    config: Arc<RwLock<FlotillaConfig>>,
    deployer: Arc<Deployer>,
    metrics: Arc<MetricsRing>,
    lock: Arc<flotilla_infra::LockManager>,
    cooldowns: Mutex<CooldownBook>,
    last_check: Mutex<HashMap<ServiceId, DateTime<Utc>>>,
}

impl ScalingCoordinator {
    pub fn new(
        config: Arc<RwLock<FlotillaConfig>>,
        deployer: Arc<Deployer>,
        metrics: Arc<MetricsRing>,
        lock: Arc<flotilla_infra::LockManager>,
    ) -> Self {
        Self {
            config,
            deployer,
            metrics,
            lock,
            cooldowns: Mutex::new(CooldownBook::default()),
            last_check: Mutex::new(HashMap::new()),
        }
    }

    /// One scaling cycle, mutually exclusive with the healer through the
    /// infrastructure lock. A held lock means healing is in progress; the
    /// cycle is skipped and retried next time round.
    pub async fn run_cycle(&self, holder: &str) -> FlotillaResult<()> {
        if self.lock.is_locked().await? {
            info!("infrastructure lock held, skipping auto-scaling this cycle");
            return Ok(());
        }
        match self.lock.acquire(holder).await {
            Ok(()) => {}
            Err(FlotillaError::LockHeld { holder: other }) => {
                info!("lost the lock race to {}, backing off", other);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let result = self.scale_all().await;
        // the lock comes off on every exit path
        self.lock.release(holder).await;
        result
    }

    async fn scale_all(&self) -> FlotillaResult<()> {
        let candidates: Vec<(String, String, String, AutoScalePolicy)> = {
            let config = self.config.read().await;
            let mut out = Vec::new();
            for (project, spec) in &config.projects {
                for (env, services) in &spec.environments {
                    for (name, service) in services {
                        if let Some(policy) = &service.auto_scaling {
                            out.push((
                                project.clone(),
                                env.clone(),
                                name.clone(),
                                policy.clone(),
                            ));
                        }
                    }
                }
            }
            out
        };

        for (project, env, name, policy) in candidates {
            if let Err(e) = self.check_service(&project, &env, &name, &policy).await {
                warn!("auto-scaling check for {}/{}/{}: {}", project, env, name, e);
            }
        }
        Ok(())
    }

    async fn should_check_now(&self, id: &ServiceId) -> bool {
        let last_check = self.last_check.lock().await;
        match last_check.get(id) {
            Some(at) => (Utc::now() - *at).num_seconds() >= CHECK_INTERVAL_SECS,
            None => true,
        }
    }

    async fn record_check(&self, id: &ServiceId) {
        self.last_check.lock().await.insert(id.clone(), Utc::now());
    }

    async fn check_service(
        &self,
        project: &str,
        env: &str,
        name: &str,
        policy: &AutoScalePolicy,
    ) -> FlotillaResult<()> {
        let id = self.deployer.service_id(project, env, name).await;
        if !self.should_check_now(&id).await {
            return Ok(());
        }

        let Some(record) = self.deployer.state_index().current(&id).await else {
            return Ok(());
        };
        if record.node_ips.is_empty() {
            return Ok(());
        }

        let Some(avg) = self
            .metrics
            .service_average(
                &id,
                &record.node_ips,
                ChronoDuration::minutes(METRICS_WINDOW_MINUTES),
            )
            .await
        else {
            debug!("no metrics for {}, skipping", id);
            return Ok(());
        };

        info!(
            "{}: cpu {:.1}% mem {:.1}% rps {:.1} over {} sample(s)",
            id, avg.cpu_percent, avg.memory_percent, avg.requests_per_second, avg.sample_count
        );

        let (vcpu, memory_mib, replicas) = {
            let config = self.config.read().await;
            let spec = config.service_spec(project, env, name)?;
            (spec.vcpu, spec.memory_mib, spec.replicas)
        };

        // vertical takes priority; an executed vertical action skips
        // horizontal until the next cycle
        if policy.vertical {
            if let Some((direction, (new_vcpu, new_mem))) =
                vertical_decision(vcpu, memory_mib, &avg, &policy.thresholds)
            {
                if self.cooldowns.lock().await.can_scale(&id, Axis::Vertical) {
                    info!(
                        "{}: vertical {:?} to {} vCPU / {} MiB",
                        id, direction, new_vcpu, new_mem
                    );
                    {
                        let mut config = self.config.write().await;
                        if let Some(spec) = config
                            .projects
                            .get_mut(project)
                            .and_then(|p| p.environments.get_mut(env))
                            .and_then(|e| e.get_mut(name))
                        {
                            spec.vcpu = new_vcpu;
                            spec.memory_mib = new_mem;
                        }
                    }
                    let summary = self
                        .deployer
                        .deploy(project, env, Some(name), false, None)
                        .await?;
                    if summary.succeeded() {
                        self.cooldowns
                            .lock()
                            .await
                            .record(&id, Axis::Vertical, direction);
                    } else {
                        warn!("{}: vertical scaling deploy failed: {:?}", id, summary.error);
                    }
                    self.record_check(&id).await;
                    return Ok(());
                }
            }
        }

        if policy.horizontal {
            if let Some((direction, new_count)) =
                horizontal_decision(replicas, &avg, &policy.thresholds)
            {
                if self.cooldowns.lock().await.can_scale(&id, Axis::Horizontal) {
                    info!("{}: horizontal {:?} to {} replica(s)", id, direction, new_count);
                    {
                        let mut config = self.config.write().await;
                        if let Some(spec) = config
                            .projects
                            .get_mut(project)
                            .and_then(|p| p.environments.get_mut(env))
                            .and_then(|e| e.get_mut(name))
                        {
                            spec.replicas = new_count;
                        }
                    }
                    let summary = self
                        .deployer
                        .deploy(project, env, Some(name), false, None)
                        .await?;
                    if summary.succeeded() {
                        self.cooldowns
                            .lock()
                            .await
                            .record(&id, Axis::Horizontal, direction);
                    } else {
                        warn!("{}: horizontal scaling deploy failed: {:?}", id, summary.error);
                    }
                    self.record_check(&id).await;
                }
            }
        }
        Ok(())
    }
}
