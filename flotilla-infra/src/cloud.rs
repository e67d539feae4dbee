//! IaaS adapter: node CRUD and tags over a DigitalOcean-shaped REST API.
//!
//! Transient failures (429, 5xx, transport errors) are retried here with
//! capped exponential backoff; anything that escapes is a real error and
//! aborts the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::{CloudApi, NodeRequest};
use flotilla_core::tiers;
use flotilla_core::types::{DeploymentStatus, Node};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const ACTIVE_POLL: Duration = Duration::from_secs(5);
const ACTIVE_TIMEOUT: Duration = Duration::from_secs(180);

pub struct OceanClient {
    http: Client,
    api_base: String,
    token: String,
    node_image: String,
    ssh_key_name: String,
}

#[derive(Debug, Deserialize)]
struct ApiDroplet {
    id: u64,
    name: String,
    status: String,
    created_at: String,
    size: ApiSize,
    region: ApiRegion,
    networks: ApiNetworks,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiSize {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNetworks {
    #[serde(default)]
    v4: Vec<ApiV4Network>,
}

#[derive(Debug, Deserialize)]
struct ApiV4Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl OceanClient {
    pub fn new(api_base: &str, token: &str, node_image: &str, ssh_key_name: &str) -> FlotillaResult<Self> {
        let http = Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| FlotillaError::Cloud(format!("building HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            node_image: node_image.to_string(),
            ssh_key_name: ssh_key_name.to_string(),
        })
    }

    fn retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> FlotillaResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let mut last_err = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_millis(BACKOFF_BASE_MS * (1 << (attempt - 1)));
                debug!("retrying {} {} after {:?}", method, path, backoff);
                tokio::time::sleep(backoff).await;
            }

            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token);
            if let Some(body) = &body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if status == StatusCode::NO_CONTENT || method == Method::DELETE {
                            return Ok(json!({"success": true}));
                        }
                        return resp
                            .json::<Value>()
                            .await
                            .map_err(|e| FlotillaError::Cloud(format!("decoding response: {}", e)));
                    }
                    let detail = resp.text().await.unwrap_or_default();
                    if Self::retryable(status) {
                        last_err = format!("{} {}: {} {}", method, path, status, detail);
                        continue;
                    }
                    if status == StatusCode::UNPROCESSABLE_ENTITY {
                        return Err(FlotillaError::Capacity(detail));
                    }
                    return Err(FlotillaError::Cloud(format!(
                        "{} {}: {} {}",
                        method, path, status, detail
                    )));
                }
                Err(e) => {
                    last_err = format!("{} {}: {}", method, path, e);
                    continue;
                }
            }
        }

        Err(FlotillaError::Cloud(format!(
            "gave up after {} attempts: {}",
            MAX_ATTEMPTS, last_err
        )))
    }

    fn node_from_droplet(droplet: ApiDroplet) -> FlotillaResult<Node> {
        let (vcpu, memory_mib) = tiers::capacity_for(&droplet.size.slug)?;
        let public_ip = droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone())
            .unwrap_or_default();
        let private_ip = droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "private")
            .map(|n| n.ip_address.clone());
        let status = droplet
            .tags
            .iter()
            .find_map(|t| DeploymentStatus::from_tag(t))
            .unwrap_or(DeploymentStatus::Reserve);
        let created_at = DateTime::parse_from_rfc3339(&droplet.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Node {
            id: droplet.id.to_string(),
            name: droplet.name,
            public_ip,
            private_ip,
            zone: droplet.region.slug,
            vcpu,
            memory_mib,
            status,
            tags: droplet.tags,
            created_at,
        })
    }

    async fn get_droplet(&self, node_id: &str) -> FlotillaResult<ApiDroplet> {
        let response = self
            .request(Method::GET, &format!("/droplets/{}", node_id), None)
            .await?;
        let droplet = response
            .get("droplet")
            .cloned()
            .ok_or_else(|| FlotillaError::Cloud("response missing droplet".into()))?;
        serde_json::from_value(droplet)
            .map_err(|e| FlotillaError::Cloud(format!("decoding droplet: {}", e)))
    }

    async fn ssh_key_id(&self) -> FlotillaResult<Option<u64>> {
        let response = self.request(Method::GET, "/account/keys", None).await?;
        let keys = response
            .get("ssh_keys")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(keys.iter().find_map(|k| {
            (k.get("name").and_then(Value::as_str) == Some(self.ssh_key_name.as_str()))
                .then(|| k.get("id").and_then(Value::as_u64))
                .flatten()
        }))
    }

    async fn wait_for_active(&self, node_id: &str) -> FlotillaResult<ApiDroplet> {
        let deadline = tokio::time::Instant::now() + ACTIVE_TIMEOUT;
        loop {
            let droplet = self.get_droplet(node_id).await?;
            if droplet.status == "active" {
                return Ok(droplet);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlotillaError::Cloud(format!(
                    "node {} not active after {:?}",
                    node_id, ACTIVE_TIMEOUT
                )));
            }
            tokio::time::sleep(ACTIVE_POLL).await;
        }
    }
}

#[async_trait]
impl CloudApi for OceanClient {
    async fn create_node(&self, req: &NodeRequest) -> FlotillaResult<Node> {
        let size = tiers::slug_for(req.capacity.vcpu, req.capacity.memory_mib)?;
        let ssh_keys: Vec<u64> = self.ssh_key_id().await?.into_iter().collect();

        info!(
            "creating node '{}' in {} ({} vCPU / {} MiB)",
            req.name, req.capacity.zone, req.capacity.vcpu, req.capacity.memory_mib
        );

        let body = json!({
            "name": req.name,
            "region": req.capacity.zone,
            "size": size,
            "image": self.node_image,
            "ssh_keys": ssh_keys,
            "tags": req.tags,
        });

        let response = self.request(Method::POST, "/droplets", Some(body)).await?;
        let node_id = response
            .get("droplet")
            .and_then(|d| d.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| FlotillaError::Cloud("create response missing droplet id".into()))?
            .to_string();

        let droplet = self.wait_for_active(&node_id).await?;
        let node = Self::node_from_droplet(droplet)?;
        info!("node {} ({}) is active", node.id, node.public_ip);
        Ok(node)
    }

    async fn list_nodes(&self, filter_tag: &str) -> FlotillaResult<Vec<Node>> {
        let path = format!("/droplets?tag_name={}&per_page=200", filter_tag);
        let response = self.request(Method::GET, &path, None).await?;
        let droplets = response
            .get("droplets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut nodes = Vec::with_capacity(droplets.len());
        for raw in droplets {
            let droplet: ApiDroplet = serde_json::from_value(raw)
                .map_err(|e| FlotillaError::Cloud(format!("decoding droplet: {}", e)))?;
            match Self::node_from_droplet(droplet) {
                Ok(node) => nodes.push(node),
                // unknown size slug on a foreign node should not break the sweep
                Err(e) => warn!("skipping unparseable node: {}", e),
            }
        }
        Ok(nodes)
    }

    async fn destroy_node(&self, node_id: &str) -> FlotillaResult<()> {
        info!("destroying node {}", node_id);
        self.request(Method::DELETE, &format!("/droplets/{}", node_id), None)
            .await?;
        Ok(())
    }

    async fn update_tags(
        &self,
        node_id: &str,
        add: &[String],
        remove: &[String],
    ) -> FlotillaResult<()> {
        let droplet = self.get_droplet(node_id).await?;
        let mut tags = droplet.tags;
        tags.retain(|t| !remove.contains(t));
        for tag in add {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        self.request(
            Method::PUT,
            &format!("/droplets/{}", node_id),
            Some(json!({ "tags": tags })),
        )
        .await?;
        debug!("node {} tags now {:?}", node_id, tags);
        Ok(())
    }

    async fn create_tag(&self, name: &str) -> FlotillaResult<()> {
        self.request(Method::POST, "/tags", Some(json!({ "name": name })))
            .await?;
        Ok(())
    }

    async fn list_tags(&self, prefix: &str) -> FlotillaResult<Vec<String>> {
        let response = self.request(Method::GET, "/tags?per_page=200", None).await?;
        let tags = response
            .get("tags")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tags
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .filter(|name| name.starts_with(prefix))
            .map(|name| name.to_string())
            .collect())
    }

    async fn delete_tag(&self, name: &str) -> FlotillaResult<()> {
        self.request(Method::DELETE, &format!("/tags/{}", name), None)
            .await?;
        Ok(())
    }
}
