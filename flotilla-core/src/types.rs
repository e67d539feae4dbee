use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Identity of a service: `(user, project, env, service)`.
///
/// Every index key, container name and residency tag is derived from this.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub user: String,
    pub project: String,
    pub env: String,
    pub service: String,
}

impl ServiceId {
    pub fn new(user: &str, project: &str, env: &str, service: &str) -> Self {
        Self {
            user: user.to_string(),
            project: project.to_string(),
            env: env.to_string(),
            service: service.to_string(),
        }
    }

    /// Tag recording that a node hosts this service.
    pub fn residency_tag(&self) -> String {
        format!(
            "svc:{}:{}:{}:{}",
            self.user, self.project, self.env, self.service
        )
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.user, self.project, self.env, self.service
        )
    }
}

/// Deployment-status label carried as an IaaS tag on every managed node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Idle, available to claim
    Reserve,
    /// Claimed, being prepared for promotion
    Blue,
    /// Serving production
    Green,
    /// Terminal, on its way out
    Destroying,
}

impl DeploymentStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            DeploymentStatus::Reserve => "status:reserve",
            DeploymentStatus::Blue => "status:blue",
            DeploymentStatus::Green => "status:green",
            DeploymentStatus::Destroying => "status:destroying",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "status:reserve" => Some(DeploymentStatus::Reserve),
            "status:blue" => Some(DeploymentStatus::Blue),
            "status:green" => Some(DeploymentStatus::Green),
            "status:destroying" => Some(DeploymentStatus::Destroying),
            _ => None,
        }
    }

    pub fn all() -> [DeploymentStatus; 4] {
        [
            DeploymentStatus::Reserve,
            DeploymentStatus::Blue,
            DeploymentStatus::Green,
            DeploymentStatus::Destroying,
        ]
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Reserve => "reserve",
            DeploymentStatus::Blue => "blue",
            DeploymentStatus::Green => "green",
            DeploymentStatus::Destroying => "destroying",
        };
        write!(f, "{}", s)
    }
}

/// Capacity profile requested for a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capacity {
    pub zone: String,
    pub vcpu: u32,
    pub memory_mib: u32,
}

/// A managed compute node as known to the inventory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub zone: String,
    pub vcpu: u32,
    pub memory_mib: u32,
    pub status: DeploymentStatus,
    /// Provider tags, the canonical store for status and residency
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn matches(&self, capacity: &Capacity) -> bool {
        self.zone == capacity.zone
            && self.vcpu == capacity.vcpu
            && self.memory_mib == capacity.memory_mib
    }

    /// Whether the node's residency tags say it hosts the given service.
    pub fn hosts(&self, service: &ServiceId) -> bool {
        let tag = service.residency_tag();
        self.tags.iter().any(|t| *t == tag)
    }
}

/// How a service's image is produced. Exactly one variant is authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Pre-built image pulled from a registry, e.g. `postgres:16`
    Registry(String),
    /// Dockerfile on disk, built and pushed by the deployer
    DockerfilePath(PathBuf),
    /// Inline dockerfile content, written to a temp file before build
    Inline(String),
}

impl ImageSource {
    pub fn needs_build(&self) -> bool {
        !matches!(self, ImageSource::Registry(_))
    }
}

/// Whether a service runs forever or on a cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    LongRunning,
    /// Cron expression, 5 or 6 fields
    Scheduled(String),
}

/// Auto-scaling thresholds, merged over these defaults per service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleThresholds {
    pub cpu_up: f64,
    pub cpu_down: f64,
    pub mem_up: f64,
    pub mem_down: f64,
    pub rps_up: f64,
    pub rps_down: f64,
}

impl Default for ScaleThresholds {
    fn default() -> Self {
        Self {
            cpu_up: 75.0,
            cpu_down: 20.0,
            mem_up: 80.0,
            mem_down: 30.0,
            rps_up: 500.0,
            rps_down: 50.0,
        }
    }
}

/// Per-service auto-scaling policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoScalePolicy {
    #[serde(default = "default_true")]
    pub vertical: bool,
    #[serde(default = "default_true")]
    pub horizontal: bool,
    #[serde(default)]
    pub thresholds: ScaleThresholds,
}

fn default_true() -> bool {
    true
}

impl Default for AutoScalePolicy {
    fn default() -> Self {
        Self {
            vertical: true,
            horizontal: true,
            thresholds: ScaleThresholds::default(),
        }
    }
}

/// Declarative description of one service within a project environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: ImageSource,
    #[serde(default = "RunMode::long_running")]
    pub run_mode: RunMode,
    /// Container ports the service listens on
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Replica count per zone
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Zones the service runs in; multiple zones deploy in parallel
    pub zones: Vec<String>,
    pub vcpu: u32,
    pub memory_mib: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_startup_order")]
    pub startup_order: i32,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Keep demoted greens in the reserve pool instead of destroying them
    #[serde(default)]
    pub keep_reserve: bool,
    #[serde(default = "default_true")]
    pub restart: bool,
    #[serde(default)]
    pub auto_scaling: Option<AutoScalePolicy>,
    /// Public domain fronted by the gateway, if any
    #[serde(default)]
    pub domain: Option<String>,
}

impl RunMode {
    fn long_running() -> Self {
        RunMode::LongRunning
    }
}

fn default_replicas() -> u32 {
    1
}

fn default_startup_order() -> i32 {
    999
}

impl ServiceSpec {
    pub fn capacity_in(&self, zone: &str) -> Capacity {
        Capacity {
            zone: zone.to_string(),
            vcpu: self.vcpu,
            memory_mib: self.memory_mib,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.run_mode, RunMode::Scheduled(_))
    }

    /// HTTP probing is skipped for port-less services and known datastores.
    pub fn wants_http_gate(&self, service_name: &str) -> bool {
        !self.ports.is_empty() && !matches!(service_name, "postgres" | "redis")
    }
}

/// Immutable record of one successful (or rolled-back-to) deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub service: ServiceId,
    pub version: String,
    pub node_ips: Vec<String>,
    pub container_name: String,
    pub deployed_at: DateTime<Utc>,
    pub actor: String,
}

/// One point-in-time observation for a `(node, service)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub requests_per_second: f64,
}

/// Averages over a metrics window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricAverages {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub requests_per_second: f64,
    pub sample_count: usize,
}
