//! Infrastructure lock: one advisory mutex between healer and auto-scaler.
//!
//! Modelled as a TTL'd lease stored in an account-level provider tag
//! `flotilla-lock:{holder}:{unix_ts}`. A janitor pass reclaims expired
//! leases before every acquisition, so a crashed holder cannot wedge the
//! fleet. Leadership is a heuristic; this lease is the real mutual
//! exclusion, and release is mandatory on every exit path.

use chrono::Utc;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::CloudApi;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCK_PREFIX: &str = "flotilla-lock:";

/// Default lease lifetime in seconds.
pub const DEFAULT_TTL_SECS: i64 = 600;

#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: i64,
    tag: String,
}

fn parse_lease(tag: &str) -> Option<Lease> {
    let rest = tag.strip_prefix(LOCK_PREFIX)?;
    let (holder, ts) = rest.rsplit_once(':')?;
    Some(Lease {
        holder: holder.to_string(),
        acquired_at: ts.parse().ok()?,
        tag: tag.to_string(),
    })
}

pub struct LockManager {
    cloud: Arc<dyn CloudApi>,
    ttl_secs: i64,
}

impl LockManager {
    pub fn new(cloud: Arc<dyn CloudApi>, ttl_secs: i64) -> Self {
        Self { cloud, ttl_secs }
    }

    async fn live_leases(&self) -> FlotillaResult<Vec<Lease>> {
        let now = Utc::now().timestamp();
        let mut live = Vec::new();
        for tag in self.cloud.list_tags(LOCK_PREFIX).await? {
            let Some(lease) = parse_lease(&tag) else {
                warn!("malformed lock tag '{}', reclaiming", tag);
                let _ = self.cloud.delete_tag(&tag).await;
                continue;
            };
            if now - lease.acquired_at >= self.ttl_secs {
                info!(
                    "reclaiming expired lease from {} (age {}s)",
                    lease.holder,
                    now - lease.acquired_at
                );
                let _ = self.cloud.delete_tag(&lease.tag).await;
            } else {
                live.push(lease);
            }
        }
        Ok(live)
    }

    /// Whether anyone currently holds a live lease.
    pub async fn is_locked(&self) -> FlotillaResult<bool> {
        Ok(!self.live_leases().await?.is_empty())
    }

    /// Take the lock for `holder`. Fails with [`FlotillaError::LockHeld`]
    /// when a live lease belongs to someone else; re-acquiring one's own
    /// lease refreshes it.
    pub async fn acquire(&self, holder: &str) -> FlotillaResult<()> {
        let live = self.live_leases().await?;
        if let Some(lease) = live.iter().find(|l| l.holder != holder) {
            return Err(FlotillaError::LockHeld {
                holder: lease.holder.clone(),
            });
        }
        // refresh: drop our own older lease before writing the new one
        for lease in live {
            let _ = self.cloud.delete_tag(&lease.tag).await;
        }
        let tag = format!("{}{}:{}", LOCK_PREFIX, holder, Utc::now().timestamp());
        self.cloud.create_tag(&tag).await?;
        debug!("lock acquired by {}", holder);
        Ok(())
    }

    /// Drop the caller's lease. Never fails the caller: a release that finds
    /// nothing to delete is already released.
    pub async fn release(&self, holder: &str) {
        match self.cloud.list_tags(LOCK_PREFIX).await {
            Ok(tags) => {
                for tag in tags {
                    if let Some(lease) = parse_lease(&tag) {
                        if lease.holder == holder {
                            if let Err(e) = self.cloud.delete_tag(&tag).await {
                                warn!("releasing lock for {}: {}", holder, e);
                            } else {
                                debug!("lock released by {}", holder);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("listing lock tags on release: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flotilla_core::ops::NodeRequest;
    use flotilla_core::types::Node;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TagStore {
        tags: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudApi for TagStore {
        async fn create_node(&self, _req: &NodeRequest) -> FlotillaResult<Node> {
            unimplemented!("lock tests never provision")
        }
        async fn list_nodes(&self, _filter_tag: &str) -> FlotillaResult<Vec<Node>> {
            Ok(vec![])
        }
        async fn destroy_node(&self, _node_id: &str) -> FlotillaResult<()> {
            Ok(())
        }
        async fn update_tags(
            &self,
            _node_id: &str,
            _add: &[String],
            _remove: &[String],
        ) -> FlotillaResult<()> {
            Ok(())
        }
        async fn create_tag(&self, name: &str) -> FlotillaResult<()> {
            self.tags.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn list_tags(&self, prefix: &str) -> FlotillaResult<Vec<String>> {
            Ok(self
                .tags
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.starts_with(prefix))
                .cloned()
                .collect())
        }
        async fn delete_tag(&self, name: &str) -> FlotillaResult<()> {
            self.tags.lock().unwrap().retain(|t| t != name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn acquire_then_contend_then_release() {
        let cloud = Arc::new(TagStore::default());
        let lock = LockManager::new(cloud.clone(), DEFAULT_TTL_SECS);

        lock.acquire("10.0.0.1").await.unwrap();
        assert!(lock.is_locked().await.unwrap());

        let err = lock.acquire("10.0.0.2").await.unwrap_err();
        assert!(matches!(err, FlotillaError::LockHeld { holder } if holder == "10.0.0.1"));

        lock.release("10.0.0.1").await;
        assert!(!lock.is_locked().await.unwrap());
        lock.acquire("10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let cloud = Arc::new(TagStore::default());
        let stale = format!(
            "{}10.0.0.9:{}",
            LOCK_PREFIX,
            Utc::now().timestamp() - 3600
        );
        cloud.create_tag(&stale).await.unwrap();

        let lock = LockManager::new(cloud.clone(), DEFAULT_TTL_SECS);
        assert!(!lock.is_locked().await.unwrap());
        lock.acquire("10.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn reacquire_refreshes_own_lease() {
        let cloud = Arc::new(TagStore::default());
        let lock = LockManager::new(cloud.clone(), DEFAULT_TTL_SECS);

        lock.acquire("10.0.0.1").await.unwrap();
        lock.acquire("10.0.0.1").await.unwrap();
        assert_eq!(cloud.list_tags(LOCK_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_tags_are_swept() {
        let cloud = Arc::new(TagStore::default());
        cloud
            .create_tag(&format!("{}garbage", LOCK_PREFIX))
            .await
            .unwrap();
        let lock = LockManager::new(cloud.clone(), DEFAULT_TTL_SECS);
        assert!(!lock.is_locked().await.unwrap());
        assert!(cloud.list_tags(LOCK_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_of_unheld_lock_is_noop() {
        let cloud = Arc::new(TagStore::default());
        let lock = LockManager::new(cloud, DEFAULT_TTL_SECS);
        lock.release("10.0.0.1").await;
        assert!(!lock.is_locked().await.unwrap());
    }
}
