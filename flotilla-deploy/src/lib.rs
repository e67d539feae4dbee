pub mod deployer;
pub mod gateway;
pub mod healer;
pub mod images;
pub mod rollback;
pub mod scaler;
pub mod schedule;

pub use deployer::{DeploySummary, Deployer, startup_order};
pub use gateway::LogGateway;
pub use healer::Healer;
pub use images::ShellImageBuilder;
pub use rollback::{RegistryProbe, rollback};
pub use scaler::ScalingCoordinator;
pub use schedule::ScheduledJobInstaller;

/// Shared mock implementations for this crate's tests.
#[cfg(test)]
pub(crate) mod testutil {
    use async_trait::async_trait;
    use chrono::Utc;
    use flotilla_core::config::{FlotillaConfig, ProjectSpec};
    use flotilla_core::error::{FlotillaError, FlotillaResult};
    use flotilla_core::ops::{
        CloudApi, CommandRunner, ContainerStatus, NodeAgent, NodeRequest, RunSpec,
    };
    use flotilla_core::types::{
        Capacity, DeploymentStatus, ImageSource, Node, RunMode, ServiceSpec,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    pub fn test_spec() -> ServiceSpec {
        ServiceSpec {
            image: ImageSource::Registry("flotilla/sample:1.0".into()),
            run_mode: RunMode::LongRunning,
            ports: vec![8000],
            replicas: 1,
            zones: vec!["lon1".into()],
            vcpu: 2,
            memory_mib: 4096,
            depends_on: vec![],
            startup_order: 999,
            env_vars: HashMap::new(),
            command: None,
            keep_reserve: false,
            restart: true,
            auto_scaling: None,
            domain: None,
        }
    }

    pub fn test_config(project: &str, env: &str, service: &str, spec: ServiceSpec) -> FlotillaConfig {
        let mut config = FlotillaConfig::default();
        let mut services = HashMap::new();
        services.insert(service.to_string(), spec);
        let mut environments = HashMap::new();
        environments.insert(env.to_string(), services);
        config.projects.insert(
            project.to_string(),
            ProjectSpec {
                version: "1.0.0".to_string(),
                environments,
            },
        );
        config
    }

    /// In-memory IaaS: nodes in a map, tags as strings, sequential IPs.
    pub struct MockCloud {
        nodes: Mutex<HashMap<String, Node>>,
        account_tags: Mutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl MockCloud {
        pub fn new() -> Self {
            Self {
                nodes: Mutex::new(HashMap::new()),
                account_tags: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn seed(&self, status: DeploymentStatus, ip: &str, capacity: &Capacity) -> String {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            let node = Node {
                id: id.clone(),
                name: format!("node-{}", id),
                public_ip: ip.to_string(),
                private_ip: None,
                zone: capacity.zone.clone(),
                vcpu: capacity.vcpu,
                memory_mib: capacity.memory_mib,
                status,
                tags: vec!["deployer".to_string(), status.as_tag().to_string()],
                created_at: Utc::now(),
            };
            self.nodes.lock().unwrap().insert(id.clone(), node);
            id
        }

        pub fn nodes_with_tag(&self, tag: &str) -> Vec<String> {
            self.nodes
                .lock()
                .unwrap()
                .values()
                .filter(|n| n.tags.iter().any(|t| t == tag))
                .map(|n| n.public_ip.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CloudApi for MockCloud {
        async fn create_node(&self, req: &NodeRequest) -> FlotillaResult<Node> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let node = Node {
                id: id.to_string(),
                name: req.name.clone(),
                public_ip: format!("10.0.0.{}", id),
                private_ip: None,
                zone: req.capacity.zone.clone(),
                vcpu: req.capacity.vcpu,
                memory_mib: req.capacity.memory_mib,
                status: DeploymentStatus::Reserve,
                tags: req.tags.clone(),
                created_at: Utc::now(),
            };
            self.nodes
                .lock()
                .unwrap()
                .insert(node.id.clone(), node.clone());
            Ok(node)
        }

        async fn list_nodes(&self, filter_tag: &str) -> FlotillaResult<Vec<Node>> {
            Ok(self
                .nodes
                .lock()
                .unwrap()
                .values()
                .filter(|n| n.tags.iter().any(|t| t == filter_tag))
                .cloned()
                .collect())
        }

        async fn destroy_node(&self, node_id: &str) -> FlotillaResult<()> {
            self.nodes.lock().unwrap().remove(node_id);
            Ok(())
        }

        async fn update_tags(
            &self,
            node_id: &str,
            add: &[String],
            remove: &[String],
        ) -> FlotillaResult<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| FlotillaError::Cloud(format!("no node {}", node_id)))?;
            node.tags.retain(|t| !remove.contains(t));
            for tag in add {
                if !node.tags.contains(tag) {
                    node.tags.push(tag.clone());
                }
            }
            if let Some(status) = node.tags.iter().find_map(|t| DeploymentStatus::from_tag(t)) {
                node.status = status;
            }
            Ok(())
        }

        async fn create_tag(&self, name: &str) -> FlotillaResult<()> {
            self.account_tags.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn list_tags(&self, prefix: &str) -> FlotillaResult<Vec<String>> {
            Ok(self
                .account_tags
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn delete_tag(&self, name: &str) -> FlotillaResult<()> {
            self.account_tags.lock().unwrap().retain(|t| t != name);
            Ok(())
        }
    }

    /// Scripted node agent: containers are rows per IP; `crashing` makes
    /// every started container report `exited`.
    pub struct MockAgent {
        healthy: bool,
        containers: Mutex<HashMap<String, Vec<String>>>,
        unreachable: Mutex<HashSet<String>>,
        started: AtomicUsize,
        removed: AtomicUsize,
    }

    impl MockAgent {
        pub fn healthy() -> Self {
            Self {
                healthy: true,
                containers: Mutex::new(HashMap::new()),
                unreachable: Mutex::new(HashSet::new()),
                started: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
            }
        }

        pub fn crashing() -> Self {
            Self {
                healthy: false,
                ..Self::healthy()
            }
        }

        pub fn seed_container(&self, ip: &str, name: &str) {
            self.containers
                .lock()
                .unwrap()
                .entry(ip.to_string())
                .or_default()
                .push(name.to_string());
        }

        pub fn set_unreachable(&self, ip: &str) {
            self.unreachable.lock().unwrap().insert(ip.to_string());
        }

        pub fn containers_started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        pub fn containers_removed(&self) -> usize {
            self.removed.load(Ordering::SeqCst)
        }

        fn reachable(&self, ip: &str) -> FlotillaResult<()> {
            if self.unreachable.lock().unwrap().contains(ip) {
                Err(FlotillaError::Agent(format!("{} unreachable", ip)))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl NodeAgent for MockAgent {
        async fn run_container(&self, node_ip: &str, spec: &RunSpec) -> FlotillaResult<()> {
            self.reachable(node_ip)?;
            self.seed_container(node_ip, &spec.name);
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_container(
            &self,
            node_ip: &str,
            _name: &str,
            _ignore_missing: bool,
        ) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn remove_container(
            &self,
            node_ip: &str,
            name: &str,
            _ignore_missing: bool,
        ) -> FlotillaResult<()> {
            self.reachable(node_ip)?;
            if let Some(list) = self.containers.lock().unwrap().get_mut(node_ip) {
                list.retain(|c| c != name);
            }
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart_container(&self, node_ip: &str, _name: &str) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn list_containers(&self, node_ip: &str) -> FlotillaResult<Vec<String>> {
            self.reachable(node_ip)?;
            Ok(self
                .containers
                .lock()
                .unwrap()
                .get(node_ip)
                .cloned()
                .unwrap_or_default())
        }

        async fn container_status(
            &self,
            node_ip: &str,
            name: &str,
        ) -> FlotillaResult<ContainerStatus> {
            self.reachable(node_ip)?;
            let present = self
                .containers
                .lock()
                .unwrap()
                .get(node_ip)
                .map(|l| l.iter().any(|c| c == name))
                .unwrap_or(false);
            let state = match (present, self.healthy) {
                (false, _) => "missing",
                (true, true) => "running",
                (true, false) => "exited",
            };
            Ok(ContainerStatus {
                name: name.to_string(),
                state: state.to_string(),
                cpu_percent: 50.0,
                memory_percent: 40.0,
                requests_per_second: 100.0,
            })
        }

        async fn container_logs(
            &self,
            node_ip: &str,
            _name: &str,
            _lines: u32,
        ) -> FlotillaResult<String> {
            self.reachable(node_ip)?;
            Ok(String::new())
        }

        async fn pull_image(&self, node_ip: &str, _image: &str) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn upload_archive(
            &self,
            node_ip: &str,
            _archive: &[u8],
            _extract_path: &str,
        ) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn ensure_network(&self, node_ip: &str, _network: &str) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn ensure_volume(&self, node_ip: &str, _volume: &str) -> FlotillaResult<()> {
            self.reachable(node_ip)
        }

        async fn runtime_alive(&self, node_ip: &str) -> bool {
            self.reachable(node_ip).is_ok()
        }
    }

    /// Command runner that only understands `ping`, with a scripted set of
    /// dead targets; everything else succeeds silently.
    pub struct PingRunner {
        dead: HashSet<String>,
    }

    impl PingRunner {
        pub fn with_dead(dead: &[&str]) -> Self {
            Self {
                dead: dead.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for PingRunner {
        async fn run(&self, _host: &str, command: &str) -> FlotillaResult<String> {
            if command.starts_with("ping") {
                if let Some(target) = command.split_whitespace().last() {
                    if self.dead.contains(target) {
                        return Err(FlotillaError::Internal(format!("{} unreachable", target)));
                    }
                }
            }
            Ok(String::new())
        }
    }

    /// Command runner that records everything it is asked to run and
    /// optionally fails each call.
    pub struct RecordingRunner {
        commands: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub fn commands(&self) -> Vec<(String, String)> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, host: &str, command: &str) -> FlotillaResult<String> {
            self.commands
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_string()));
            if self.fail {
                Err(FlotillaError::Internal(format!(
                    "scripted failure: {}",
                    command
                )))
            } else {
                Ok(String::new())
            }
        }
    }

    /// Notifier that remembers what it was asked to send.
    #[derive(Default)]
    pub struct CaptureNotifier {
        sent: tokio::sync::Mutex<Vec<(String, String)>>,
    }

    impl CaptureNotifier {
        pub async fn subjects(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|(s, _)| s.clone()).collect()
        }
    }

    #[async_trait]
    impl flotilla_core::ops::Notifier for CaptureNotifier {
        async fn send(&self, subject: &str, body: &str) {
            self.sent
                .lock()
                .await
                .push((subject.to_string(), body.to_string()));
        }
    }
}
