//! Node inventory: a reconciled cache of the managed fleet.
//!
//! The provider's tag set is authoritative; this cache only speeds up
//! filtering. Every sensitive operation reconciles first, and every status
//! change writes the tag before touching the cache.

use chrono::Utc;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::{CloudApi, CommandRunner, NodeRequest};
use flotilla_core::types::{Capacity, DeploymentStatus, Node, ServiceId};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Shell steps run on a freshly provisioned node: container runtime first,
/// then the node agent (which runs as a container itself).
const BOOTSTRAP_STEPS: [&str; 4] = [
    "apt-get update",
    "apt-get install -y docker.io curl",
    "systemctl enable --now docker",
    "docker run -d --name flotilla-agent --restart unless-stopped \
     -p 8800:8800 -v /var/run/docker.sock:/var/run/docker.sock \
     flotilla/agent:latest",
];

pub struct InventoryStore {
    cloud: Arc<dyn CloudApi>,
    runner: Option<Arc<dyn CommandRunner>>,
    fleet_tag: String,
    nodes: RwLock<HashMap<String, Node>>,
}

impl InventoryStore {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        fleet_tag: &str,
        runner: Option<Arc<dyn CommandRunner>>,
    ) -> Self {
        Self {
            cloud,
            runner,
            fleet_tag: fleet_tag.to_string(),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Pull the fleet from the provider and adjust the cache: nodes only in
    /// the provider are inserted, nodes only in the cache are dropped.
    /// Reconcile never destroys anything.
    pub async fn reconcile(&self) -> FlotillaResult<()> {
        let fresh = self.cloud.list_nodes(&self.fleet_tag).await?;
        let mut nodes = self.nodes.write().await;

        let fresh_ids: Vec<&str> = fresh.iter().map(|n| n.id.as_str()).collect();
        let stale: Vec<String> = nodes
            .keys()
            .filter(|id| !fresh_ids.contains(&id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            warn!("node {} gone from provider, dropping from cache", id);
            nodes.remove(&id);
        }

        for node in fresh {
            nodes.insert(node.id.clone(), node);
        }
        debug!("inventory reconciled: {} node(s)", nodes.len());
        Ok(())
    }

    pub async fn all(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn by_status(&self, status: DeploymentStatus) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    pub async fn find_by_ip(&self, ip: &str) -> Option<Node> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.public_ip == ip)
            .cloned()
    }

    /// Counts per status label.
    pub async fn summary(&self) -> HashMap<DeploymentStatus, usize> {
        let mut summary: HashMap<DeploymentStatus, usize> =
            DeploymentStatus::all().into_iter().map(|s| (s, 0)).collect();
        for node in self.nodes.read().await.values() {
            *summary.entry(node.status).or_default() += 1;
        }
        summary
    }

    /// Write the status tag for a node (removing every other status tag so a
    /// node carries at most one), then update the cache.
    async fn set_status(&self, node: &Node, status: DeploymentStatus) -> FlotillaResult<()> {
        let remove: Vec<String> = DeploymentStatus::all()
            .into_iter()
            .filter(|s| *s != status)
            .map(|s| s.as_tag().to_string())
            .collect();
        self.cloud
            .update_tags(&node.id, &[status.as_tag().to_string()], &remove)
            .await?;

        let mut nodes = self.nodes.write().await;
        if let Some(cached) = nodes.get_mut(&node.id) {
            cached.status = status;
            cached.tags.retain(|t| DeploymentStatus::from_tag(t).is_none());
            cached.tags.push(status.as_tag().to_string());
        }
        debug!("node {} ({}) → {}", node.id, node.public_ip, status);
        Ok(())
    }

    async fn bootstrap_node(&self, node: &Node) -> FlotillaResult<()> {
        let Some(runner) = &self.runner else {
            debug!("no command runner configured, skipping bootstrap of {}", node.public_ip);
            return Ok(());
        };
        info!("bootstrapping node {}", node.public_ip);
        for step in BOOTSTRAP_STEPS {
            runner.run(&node.public_ip, step).await?;
        }
        Ok(())
    }

    async fn provision(&self, capacity: &Capacity, count: usize) -> FlotillaResult<Vec<Node>> {
        info!(
            "provisioning {} node(s) in {} ({} vCPU / {} MiB)",
            count, capacity.zone, capacity.vcpu, capacity.memory_mib
        );
        let stamp = Utc::now().timestamp();
        let requests: Vec<NodeRequest> = (0..count)
            .map(|i| NodeRequest {
                name: format!("node-{}-{}-{}", capacity.zone, stamp, i),
                capacity: capacity.clone(),
                tags: vec![
                    self.fleet_tag.clone(),
                    format!("zone:{}", capacity.zone),
                    DeploymentStatus::Reserve.as_tag().to_string(),
                ],
            })
            .collect();

        let results = join_all(requests.iter().map(|req| self.cloud.create_node(req))).await;

        let mut created = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(node) => created.push(node),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        if let Some(err) = first_error {
            // partial fleets are useless to the caller; unwind what came up
            for node in &created {
                if let Err(e) = self.cloud.destroy_node(&node.id).await {
                    warn!("could not unwind partially provisioned {}: {}", node.id, e);
                }
            }
            return Err(FlotillaError::Capacity(format!(
                "provisioning {} node(s) in {}: {}",
                count, capacity.zone, err
            )));
        }

        for node in &created {
            self.bootstrap_node(node).await?;
        }

        let mut nodes = self.nodes.write().await;
        for node in &created {
            nodes.insert(node.id.clone(), node.clone());
        }
        Ok(created)
    }

    /// Claim `count` nodes of exactly the given capacity: matching reserves
    /// first, newly provisioned nodes for the shortfall, all marked blue.
    pub async fn claim(&self, count: usize, capacity: &Capacity) -> FlotillaResult<Vec<String>> {
        info!(
            "claiming {} node(s) ({} vCPU / {} MiB) in {}",
            count, capacity.vcpu, capacity.memory_mib, capacity.zone
        );
        self.reconcile().await?;

        let mut available: Vec<Node> = self
            .by_status(DeploymentStatus::Reserve)
            .await
            .into_iter()
            .filter(|n| n.matches(capacity))
            .collect();

        if available.len() < count {
            let needed = count - available.len();
            let created = self.provision(capacity, needed).await?;
            available.extend(created);
        }

        let claimed: Vec<Node> = available.into_iter().take(count).collect();
        for node in &claimed {
            self.set_status(node, DeploymentStatus::Blue).await?;
        }

        let ips: Vec<String> = claimed.iter().map(|n| n.public_ip.clone()).collect();
        info!("claimed {} node(s): {:?}", ips.len(), ips);
        Ok(ips)
    }

    /// Swap generations for one service: demote its current greens to
    /// reserve, then promote the blues to green. Demote-first ordering means
    /// the service never has two generations labelled green; callers
    /// serialize promotions through the infrastructure lock.
    pub async fn promote(
        &self,
        blue_ips: &[String],
        service: &ServiceId,
    ) -> FlotillaResult<Vec<String>> {
        self.reconcile().await?;

        let residency = service.residency_tag();
        // blues already promoted by an earlier call are not "old" greens;
        // excluding them makes a repeated promote a no-op
        let old_greens: Vec<Node> = self
            .by_status(DeploymentStatus::Green)
            .await
            .into_iter()
            .filter(|n| n.hosts(service) && !blue_ips.contains(&n.public_ip))
            .collect();

        for node in &old_greens {
            self.cloud
                .update_tags(&node.id, &[], std::slice::from_ref(&residency))
                .await?;
            self.set_status(node, DeploymentStatus::Reserve).await?;
            let mut nodes = self.nodes.write().await;
            if let Some(cached) = nodes.get_mut(&node.id) {
                cached.tags.retain(|t| *t != residency);
            }
        }

        for ip in blue_ips {
            let Some(node) = self.find_by_ip(ip).await else {
                return Err(FlotillaError::Cloud(format!(
                    "blue node {} missing from inventory at promote time",
                    ip
                )));
            };
            // a blue promoted twice is a no-op
            if node.status == DeploymentStatus::Green && node.hosts(service) {
                continue;
            }
            self.cloud
                .update_tags(&node.id, std::slice::from_ref(&residency), &[])
                .await?;
            self.set_status(&node, DeploymentStatus::Green).await?;
            let mut nodes = self.nodes.write().await;
            if let Some(cached) = nodes.get_mut(&node.id) {
                if !cached.tags.contains(&residency) {
                    cached.tags.push(residency.clone());
                }
            }
        }

        let old_ips: Vec<String> = old_greens.iter().map(|n| n.public_ip.clone()).collect();
        info!(
            "promoted {:?} to green for {}; demoted {:?}",
            blue_ips, service, old_ips
        );
        Ok(old_ips)
    }

    /// Promote a single replacement node to green, tagging it with the
    /// services it now hosts. Unlike [`promote`](Self::promote) this demotes
    /// nothing; the healer uses it after rebuilding a failed node's
    /// containers elsewhere.
    pub async fn adopt_as_green(&self, ip: &str, services: &[ServiceId]) -> FlotillaResult<()> {
        let Some(node) = self.find_by_ip(ip).await else {
            return Err(FlotillaError::Cloud(format!(
                "replacement node {} missing from inventory",
                ip
            )));
        };
        let residency: Vec<String> = services.iter().map(|s| s.residency_tag()).collect();
        self.cloud.update_tags(&node.id, &residency, &[]).await?;
        self.set_status(&node, DeploymentStatus::Green).await?;
        let mut nodes = self.nodes.write().await;
        if let Some(cached) = nodes.get_mut(&node.id) {
            for tag in residency {
                if !cached.tags.contains(&tag) {
                    cached.tags.push(tag);
                }
            }
        }
        Ok(())
    }

    /// Return nodes to the reserve pool, or destroy them outright.
    pub async fn release(&self, ips: &[String], destroy: bool) -> FlotillaResult<()> {
        for ip in ips {
            let Some(node) = self.find_by_ip(ip).await else {
                warn!("release: {} not in inventory", ip);
                continue;
            };
            if destroy {
                self.set_status(&node, DeploymentStatus::Destroying).await?;
                self.cloud.destroy_node(&node.id).await?;
                self.nodes.write().await.remove(&node.id);
                info!("destroyed node {} ({})", node.id, ip);
            } else {
                self.set_status(&node, DeploymentStatus::Reserve).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory provider: nodes are rows in a map, tags are plain strings.
    pub struct MockCloud {
        nodes: StdMutex<HashMap<String, Node>>,
        next_id: AtomicU64,
        fail_creates: StdMutex<usize>,
    }

    impl MockCloud {
        pub fn new() -> Self {
            Self {
                nodes: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fail_creates: StdMutex::new(0),
            }
        }

        pub fn fail_next_creates(&self, n: usize) {
            *self.fail_creates.lock().unwrap() = n;
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

        pub fn tags_of(&self, ip: &str) -> Vec<String> {
            self.nodes
                .lock()
                .unwrap()
                .values()
                .find(|n| n.public_ip == ip)
                .map(|n| n.tags.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl CloudApi for MockCloud {
        async fn create_node(&self, req: &NodeRequest) -> FlotillaResult<Node> {
            {
                let mut fails = self.fail_creates.lock().unwrap();
                if *fails > 0 {
                    *fails -= 1;
                    return Err(FlotillaError::Capacity("zone exhausted".into()));
                }
            }
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

        async fn create_tag(&self, _name: &str) -> FlotillaResult<()> {
            Ok(())
        }

        async fn list_tags(&self, _prefix: &str) -> FlotillaResult<Vec<String>> {
            Ok(vec![])
        }

        async fn delete_tag(&self, _name: &str) -> FlotillaResult<()> {
            Ok(())
        }
    }

    fn capacity() -> Capacity {
        Capacity {
            zone: "lon1".into(),
            vcpu: 2,
            memory_mib: 4096,
        }
    }

    #[tokio::test]
    async fn reconcile_inserts_and_drops() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed(DeploymentStatus::Reserve, "10.0.0.1", &capacity());
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        inventory.reconcile().await.unwrap();
        assert_eq!(inventory.all().await.len(), 1);

        // node destroyed behind our back
        let id = cloud.seed(DeploymentStatus::Green, "10.0.0.2", &capacity());
        inventory.reconcile().await.unwrap();
        assert_eq!(inventory.all().await.len(), 2);
        cloud.destroy_node(&id).await.unwrap();
        inventory.reconcile().await.unwrap();
        assert_eq!(inventory.all().await.len(), 1);
    }

    #[tokio::test]
    async fn claim_uses_reserves_then_provisions() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed(DeploymentStatus::Reserve, "10.0.0.1", &capacity());
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        let ips = inventory.claim(2, &capacity()).await.unwrap();
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&"10.0.0.1".to_string()));
        for ip in &ips {
            assert!(cloud.tags_of(ip).contains(&"status:blue".to_string()));
        }
    }

    #[tokio::test]
    async fn claim_ignores_capacity_mismatched_reserves() {
        let cloud = Arc::new(MockCloud::new());
        let small = Capacity {
            zone: "lon1".into(),
            vcpu: 1,
            memory_mib: 1024,
        };
        cloud.seed(DeploymentStatus::Reserve, "10.0.0.1", &small);
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        let ips = inventory.claim(1, &capacity()).await.unwrap();
        assert_eq!(ips.len(), 1);
        assert_ne!(ips[0], "10.0.0.1");
        // the mismatched reserve is untouched
        assert!(cloud.tags_of("10.0.0.1").contains(&"status:reserve".to_string()));
    }

    #[tokio::test]
    async fn failed_provisioning_unwinds_and_aborts() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_next_creates(1);
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        let err = inventory.claim(2, &capacity()).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Capacity(_)));
        // nothing claimed, nothing blue
        inventory.reconcile().await.unwrap();
        assert!(inventory.by_status(DeploymentStatus::Blue).await.is_empty());
    }

    #[tokio::test]
    async fn promote_swaps_generations_for_one_service() {
        let cloud = Arc::new(MockCloud::new());
        let service = ServiceId::new("u1", "shop", "prod", "api");
        let other = ServiceId::new("u1", "shop", "prod", "worker");

        let old_id = cloud.seed(DeploymentStatus::Green, "10.0.0.1", &capacity());
        cloud
            .update_tags(&old_id, &[service.residency_tag()], &[])
            .await
            .unwrap();
        let other_id = cloud.seed(DeploymentStatus::Green, "10.0.0.2", &capacity());
        cloud
            .update_tags(&other_id, &[other.residency_tag()], &[])
            .await
            .unwrap();
        cloud.seed(DeploymentStatus::Blue, "10.0.0.3", &capacity());

        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);
        let old = inventory
            .promote(&["10.0.0.3".to_string()], &service)
            .await
            .unwrap();

        assert_eq!(old, vec!["10.0.0.1".to_string()]);
        assert!(cloud.tags_of("10.0.0.1").contains(&"status:reserve".to_string()));
        assert!(!cloud.tags_of("10.0.0.1").contains(&service.residency_tag()));
        assert!(cloud.tags_of("10.0.0.3").contains(&"status:green".to_string()));
        assert!(cloud.tags_of("10.0.0.3").contains(&service.residency_tag()));
        // the other service's green is untouched
        assert!(cloud.tags_of("10.0.0.2").contains(&"status:green".to_string()));
    }

    #[tokio::test]
    async fn promote_twice_is_one_transition_then_noop() {
        let cloud = Arc::new(MockCloud::new());
        let service = ServiceId::new("u1", "shop", "prod", "api");
        cloud.seed(DeploymentStatus::Blue, "10.0.0.3", &capacity());
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        let blues = vec!["10.0.0.3".to_string()];
        let first = inventory.promote(&blues, &service).await.unwrap();
        assert!(first.is_empty());
        // second promote finds the work already done: the node is this
        // service's green now, so it must not be demoted-and-repromoted
        let second = inventory.promote(&blues, &service).await.unwrap();
        assert!(second.is_empty());
        assert!(cloud.tags_of("10.0.0.3").contains(&"status:green".to_string()));
    }

    #[tokio::test]
    async fn release_destroy_removes_from_provider() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed(DeploymentStatus::Reserve, "10.0.0.1", &capacity());
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);
        inventory.reconcile().await.unwrap();

        inventory
            .release(&["10.0.0.1".to_string()], true)
            .await
            .unwrap();
        assert!(cloud.list_nodes("deployer").await.unwrap().is_empty());
        assert!(inventory.all().await.is_empty());
    }

    #[tokio::test]
    async fn at_most_one_status_tag() {
        let cloud = Arc::new(MockCloud::new());
        cloud.seed(DeploymentStatus::Reserve, "10.0.0.1", &capacity());
        let inventory = InventoryStore::new(cloud.clone(), "deployer", None);

        inventory.claim(1, &capacity()).await.unwrap();
        let status_tags: Vec<String> = cloud
            .tags_of("10.0.0.1")
            .into_iter()
            .filter(|t| DeploymentStatus::from_tag(t).is_some())
            .collect();
        assert_eq!(status_tags, vec!["status:blue".to_string()]);
    }
}
