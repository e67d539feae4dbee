//! Capability traits at the seams of the control plane.
//!
//! These live in the leaf crate so the deployer, healer and scaler depend on
//! interfaces rather than concrete clients. Every implementation is injected
//! at startup; tests swap in mocks.

use crate::error::FlotillaResult;
use crate::types::{Capacity, ImageSource, Node, ServiceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request to provision one compute node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRequest {
    pub name: String,
    pub capacity: Capacity,
    pub tags: Vec<String>,
}

/// IaaS provider surface: node CRUD plus string tags.
///
/// The provider's tag store is the canonical record of deployment status and
/// service residency; account-level tags back the infrastructure lock lease.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Provision a node and wait for it (and its agent) to come up.
    async fn create_node(&self, req: &NodeRequest) -> FlotillaResult<Node>;

    /// Nodes carrying the given tag.
    async fn list_nodes(&self, filter_tag: &str) -> FlotillaResult<Vec<Node>>;

    async fn destroy_node(&self, node_id: &str) -> FlotillaResult<()>;

    async fn update_tags(
        &self,
        node_id: &str,
        add: &[String],
        remove: &[String],
    ) -> FlotillaResult<()>;

    async fn create_tag(&self, name: &str) -> FlotillaResult<()>;

    /// Account tags starting with the given prefix.
    async fn list_tags(&self, prefix: &str) -> FlotillaResult<Vec<String>>;

    async fn delete_tag(&self, name: &str) -> FlotillaResult<()>;
}

/// What to run on a node, as the agent understands it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// host port → container port
    #[serde(default)]
    pub ports: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "RunSpec::default_restart_policy")]
    pub restart_policy: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl RunSpec {
    fn default_restart_policy() -> String {
        "unless-stopped".to_string()
    }
}

/// Agent-reported status of one container, stats included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    /// `running`, `exited`, `missing`, ...
    pub state: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub requests_per_second: f64,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// HTTP agent running on every node: container lifecycle, image pulls,
/// chunked file uploads, network/volume management.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn run_container(&self, node_ip: &str, spec: &RunSpec) -> FlotillaResult<()>;

    async fn stop_container(
        &self,
        node_ip: &str,
        name: &str,
        ignore_missing: bool,
    ) -> FlotillaResult<()>;

    async fn remove_container(
        &self,
        node_ip: &str,
        name: &str,
        ignore_missing: bool,
    ) -> FlotillaResult<()>;

    async fn restart_container(&self, node_ip: &str, name: &str) -> FlotillaResult<()>;

    async fn list_containers(&self, node_ip: &str) -> FlotillaResult<Vec<String>>;

    async fn container_status(&self, node_ip: &str, name: &str) -> FlotillaResult<ContainerStatus>;

    async fn container_logs(&self, node_ip: &str, name: &str, lines: u32) -> FlotillaResult<String>;

    async fn pull_image(&self, node_ip: &str, image: &str) -> FlotillaResult<()>;

    /// Upload a tar.gz and extract it at the given path. Re-uploading the
    /// same archive is idempotent.
    async fn upload_archive(
        &self,
        node_ip: &str,
        archive: &[u8],
        extract_path: &str,
    ) -> FlotillaResult<()>;

    async fn ensure_network(&self, node_ip: &str, network: &str) -> FlotillaResult<()>;

    async fn ensure_volume(&self, node_ip: &str, volume: &str) -> FlotillaResult<()>;

    /// Whether the container runtime on the node answers at all.
    async fn runtime_alive(&self, node_ip: &str) -> bool;
}

/// Remote command execution, the SSH seam. Only the scheduled-job installer
/// and the healer's reachability probe use it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, host: &str, command: &str) -> FlotillaResult<String>;
}

/// Image production seam; the docker build/push executor lives behind it.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, source: &ImageSource, image_ref: &str) -> FlotillaResult<()>;
    async fn push(&self, image_ref: &str) -> FlotillaResult<()>;
}

/// Critical-alert channel. Failures to deliver are logged, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

/// Gateway/proxy fronting services with a public domain.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn update_backends(
        &self,
        service: &ServiceId,
        domain: &str,
        backend_ips: &[String],
    ) -> FlotillaResult<()>;
}
