//! Deployment state index: which nodes run which service at which version.
//!
//! Keyed `user → project → env → service`, each leaf holding the current
//! deployment plus a bounded history. The whole index is one JSON document;
//! every mutation materializes the full document to a temp file and renames
//! it into place, so readers never observe a torn write.

use crate::error::{FlotillaError, FlotillaResult};
use crate::types::{DeploymentRecord, ServiceId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Deployments kept per service, newest first.
pub const MAX_HISTORY: usize = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceState {
    pub current: Option<DeploymentRecord>,
    #[serde(default)]
    pub history: Vec<DeploymentRecord>,
}

type Document = HashMap<String, HashMap<String, HashMap<String, HashMap<String, ServiceState>>>>;

/// Process-local deployment index with atomic JSON persistence.
///
/// Writes serialize on the inner mutex; readers get value snapshots.
pub struct StateIndex {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl StateIndex {
    /// Load the index from disk, starting empty if the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> FlotillaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| FlotillaError::State(format!("corrupt index {:?}: {}", path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no deployment index at {:?}, starting empty", path);
                Document::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    async fn persist(&self, doc: &Document) -> FlotillaResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Record a successful deployment: becomes `current` and the head of
    /// history, trimming the tail past [`MAX_HISTORY`].
    pub async fn record_deployment(&self, record: DeploymentRecord) -> FlotillaResult<()> {
        let mut doc = self.doc.lock().await;
        let id = record.service.clone();
        let state = doc
            .entry(id.user.clone())
            .or_default()
            .entry(id.project.clone())
            .or_default()
            .entry(id.env.clone())
            .or_default()
            .entry(id.service.clone())
            .or_default();

        state.current = Some(record.clone());
        state.history.insert(0, record.clone());
        state.history.truncate(MAX_HISTORY);

        self.persist(&doc).await?;
        info!(
            "recorded deployment {} v{} on {} node(s)",
            id,
            record.version,
            record.node_ips.len()
        );
        Ok(())
    }

    fn lookup<'a>(doc: &'a Document, id: &ServiceId) -> Option<&'a ServiceState> {
        doc.get(&id.user)?
            .get(&id.project)?
            .get(&id.env)?
            .get(&id.service)
    }

    pub async fn current(&self, id: &ServiceId) -> Option<DeploymentRecord> {
        let doc = self.doc.lock().await;
        Self::lookup(&doc, id).and_then(|s| s.current.clone())
    }

    /// Deployment history, newest first.
    pub async fn history(&self, id: &ServiceId) -> Vec<DeploymentRecord> {
        let doc = self.doc.lock().await;
        Self::lookup(&doc, id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// The version before the current one, if any.
    pub async fn previous_version(&self, id: &ServiceId) -> Option<String> {
        let history = self.history(id).await;
        history.get(1).map(|r| r.version.clone())
    }

    /// Versions ever deployed, newest first, de-duplicated.
    pub async fn version_history(&self, id: &ServiceId) -> Vec<String> {
        let mut seen = Vec::new();
        for record in self.history(id).await {
            if !seen.contains(&record.version) {
                seen.push(record.version);
            }
        }
        seen
    }

    /// All services whose current deployment includes the given node.
    /// Answered by scan; the fleet is small.
    pub async fn services_on_node(&self, node_ip: &str) -> Vec<DeploymentRecord> {
        let doc = self.doc.lock().await;
        let mut out = Vec::new();
        for projects in doc.values() {
            for envs in projects.values() {
                for services in envs.values() {
                    for state in services.values() {
                        if let Some(current) = &state.current {
                            if current.node_ips.iter().any(|ip| ip == node_ip) {
                                out.push(current.clone());
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Rewrite every current deployment replacing `old_ip` with `new_ip`.
    /// Used by the healer after a successful node replacement.
    pub async fn swap_node(&self, old_ip: &str, new_ip: &str) -> FlotillaResult<usize> {
        let mut doc = self.doc.lock().await;
        let mut swapped = 0;
        for projects in doc.values_mut() {
            for envs in projects.values_mut() {
                for services in envs.values_mut() {
                    for state in services.values_mut() {
                        if let Some(current) = &mut state.current {
                            for ip in current.node_ips.iter_mut() {
                                if ip == old_ip {
                                    *ip = new_ip.to_string();
                                    swapped += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        if swapped > 0 {
            self.persist(&doc).await?;
            info!("swapped {} → {} in {} deployment(s)", old_ip, new_ip, swapped);
        }
        Ok(swapped)
    }

    /// Drop a node from every current deployment.
    pub async fn remove_node_everywhere(&self, node_ip: &str) -> FlotillaResult<usize> {
        let mut doc = self.doc.lock().await;
        let mut removed = 0;
        for projects in doc.values_mut() {
            for envs in projects.values_mut() {
                for services in envs.values_mut() {
                    for state in services.values_mut() {
                        if let Some(current) = &mut state.current {
                            let before = current.node_ips.len();
                            current.node_ips.retain(|ip| ip != node_ip);
                            removed += before - current.node_ips.len();
                        }
                    }
                }
            }
        }
        if removed > 0 {
            self.persist(&doc).await?;
        }
        Ok(removed)
    }

    /// Add a node to a service's current deployment, if absent.
    pub async fn add_node(&self, id: &ServiceId, node_ip: &str) -> FlotillaResult<()> {
        let mut doc = self.doc.lock().await;
        let Some(state) = doc
            .get_mut(&id.user)
            .and_then(|p| p.get_mut(&id.project))
            .and_then(|e| e.get_mut(&id.env))
            .and_then(|s| s.get_mut(&id.service))
        else {
            warn!("add_node: {} not present in deployment index", id);
            return Ok(());
        };
        if let Some(current) = &mut state.current {
            if !current.node_ips.iter().any(|ip| ip == node_ip) {
                current.node_ips.push(node_ip.to_string());
                current.deployed_at = Utc::now();
                self.persist(&doc).await?;
            }
        }
        Ok(())
    }

    /// Snapshot of every current deployment.
    pub async fn all_current(&self) -> Vec<DeploymentRecord> {
        let doc = self.doc.lock().await;
        let mut out = Vec::new();
        for projects in doc.values() {
            for envs in projects.values() {
                for services in envs.values() {
                    for state in services.values() {
                        if let Some(current) = &state.current {
                            out.push(current.clone());
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, ips: &[&str]) -> DeploymentRecord {
        DeploymentRecord {
            service: ServiceId::new("u1", "shop", "prod", "api"),
            version: version.to_string(),
            node_ips: ips.iter().map(|s| s.to_string()).collect(),
            container_name: "u1_shop_prod_api".to_string(),
            deployed_at: Utc::now(),
            actor: "test".to_string(),
        }
    }

    async fn temp_index() -> (tempfile::TempDir, StateIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = StateIndex::load(dir.path().join("deployments.json"))
            .await
            .unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn current_is_history_head() {
        let (_dir, index) = temp_index().await;
        let id = ServiceId::new("u1", "shop", "prod", "api");

        index.record_deployment(record("v1", &["10.0.0.1"])).await.unwrap();
        index.record_deployment(record("v2", &["10.0.0.2"])).await.unwrap();

        let current = index.current(&id).await.unwrap();
        let history = index.history(&id).await;
        assert_eq!(current.version, "v2");
        assert_eq!(history[0], current);
        assert_eq!(index.previous_version(&id).await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn history_trims_at_ten() {
        let (_dir, index) = temp_index().await;
        let id = ServiceId::new("u1", "shop", "prod", "api");

        for i in 0..15 {
            index
                .record_deployment(record(&format!("v{}", i), &["10.0.0.1"]))
                .await
                .unwrap();
        }

        let history = index.history(&id).await;
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].version, "v14");
        assert_eq!(history[9].version, "v5");
    }

    #[tokio::test]
    async fn version_history_dedupes() {
        let (_dir, index) = temp_index().await;
        let id = ServiceId::new("u1", "shop", "prod", "api");

        index.record_deployment(record("v1", &["a"])).await.unwrap();
        index.record_deployment(record("v2", &["a"])).await.unwrap();
        // rollback re-inserts v1 at the head
        index.record_deployment(record("v1", &["a"])).await.unwrap();

        assert_eq!(index.version_history(&id).await, vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn node_scan_and_swap() {
        let (_dir, index) = temp_index().await;

        index
            .record_deployment(record("v1", &["10.0.0.1", "10.0.0.2"]))
            .await
            .unwrap();

        let on_node = index.services_on_node("10.0.0.1").await;
        assert_eq!(on_node.len(), 1);
        assert!(index.services_on_node("10.9.9.9").await.is_empty());

        let swapped = index.swap_node("10.0.0.1", "10.0.0.7").await.unwrap();
        assert_eq!(swapped, 1);
        let id = ServiceId::new("u1", "shop", "prod", "api");
        let current = index.current(&id).await.unwrap();
        assert!(current.node_ips.contains(&"10.0.0.7".to_string()));
        assert!(!current.node_ips.contains(&"10.0.0.1".to_string()));
    }

    #[tokio::test]
    async fn survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployments.json");

        {
            let index = StateIndex::load(&path).await.unwrap();
            index.record_deployment(record("v3", &["10.0.0.1"])).await.unwrap();
        }

        let reloaded = StateIndex::load(&path).await.unwrap();
        let id = ServiceId::new("u1", "shop", "prod", "api");
        assert_eq!(reloaded.current(&id).await.unwrap().version, "v3");
    }
}
