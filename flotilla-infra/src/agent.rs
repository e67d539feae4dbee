//! HTTP client for the agent running on every managed node.
//!
//! The agent owns the container runtime on its node; this client drives it:
//! container lifecycle, image pulls, network/volume management, and chunked
//! tar uploads for the pre-deploy payload.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::write::GzEncoder;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::{ContainerStatus, NodeAgent, RunSpec};
use reqwest::Client;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Port the node agent listens on.
pub const AGENT_PORT: u16 = 8800;

/// 5 MiB upload chunks; the last chunk triggers extraction agent-side.
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(300);
const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpAgent {
    http: Client,
    port: u16,
}

impl Default for HttpAgent {
    fn default() -> Self {
        Self::new(AGENT_PORT)
    }
}

impl HttpAgent {
    pub fn new(port: u16) -> Self {
        Self {
            http: Client::new(),
            port,
        }
    }

    fn url(&self, node_ip: &str, path: &str) -> String {
        format!("http://{}:{}{}", node_ip, self.port, path)
    }

    async fn post(
        &self,
        node_ip: &str,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> FlotillaResult<Value> {
        let mut req = self.http.post(self.url(node_ip, path)).timeout(timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FlotillaError::Agent(format!("[{}] POST {}: {}", node_ip, path, e)))?;
        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(FlotillaError::Agent(format!(
                "[{}] {} failed: {} ({})",
                node_ip, path, error, status
            )));
        }
        Ok(value)
    }

    async fn get(&self, node_ip: &str, path: &str) -> FlotillaResult<Value> {
        let resp = self
            .http
            .get(self.url(node_ip, path))
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| FlotillaError::Agent(format!("[{}] GET {}: {}", node_ip, path, e)))?;
        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(FlotillaError::Agent(format!(
                "[{}] {} failed: {} ({})",
                node_ip, path, error, status
            )));
        }
        Ok(value)
    }

    fn is_not_found(err: &FlotillaError) -> bool {
        err.to_string().to_lowercase().contains("not found")
    }
}

#[async_trait]
impl NodeAgent for HttpAgent {
    async fn run_container(&self, node_ip: &str, spec: &RunSpec) -> FlotillaResult<()> {
        info!("[{}] starting container {}", node_ip, spec.name);
        let body = serde_json::to_value(spec)?;
        let response = self
            .post(node_ip, "/containers/run", Some(body), RUN_TIMEOUT)
            .await?;
        match response.get("status").and_then(Value::as_str) {
            Some("started") => Ok(()),
            other => Err(FlotillaError::Agent(format!(
                "[{}] unexpected run response for {}: {:?}",
                node_ip, spec.name, other
            ))),
        }
    }

    async fn stop_container(
        &self,
        node_ip: &str,
        name: &str,
        ignore_missing: bool,
    ) -> FlotillaResult<()> {
        debug!("[{}] stopping container {}", node_ip, name);
        match self
            .post(node_ip, &format!("/containers/{}/stop", name), None, DEFAULT_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if ignore_missing && Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_container(
        &self,
        node_ip: &str,
        name: &str,
        ignore_missing: bool,
    ) -> FlotillaResult<()> {
        debug!("[{}] removing container {}", node_ip, name);
        match self
            .post(
                node_ip,
                &format!("/containers/{}/remove", name),
                None,
                DEFAULT_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if ignore_missing && Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn restart_container(&self, node_ip: &str, name: &str) -> FlotillaResult<()> {
        self.post(
            node_ip,
            &format!("/containers/{}/restart", name),
            None,
            RUN_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn list_containers(&self, node_ip: &str) -> FlotillaResult<Vec<String>> {
        let response = self.get(node_ip, "/containers").await?;
        Ok(response
            .get("containers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn container_status(&self, node_ip: &str, name: &str) -> FlotillaResult<ContainerStatus> {
        let response = self.get(node_ip, &format!("/containers/{}", name)).await?;
        serde_json::from_value(response)
            .map_err(|e| FlotillaError::Agent(format!("[{}] decoding status: {}", node_ip, e)))
    }

    async fn container_logs(&self, node_ip: &str, name: &str, lines: u32) -> FlotillaResult<String> {
        let response = self
            .get(node_ip, &format!("/containers/{}/logs?lines={}", name, lines))
            .await?;
        Ok(response
            .get("logs")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn pull_image(&self, node_ip: &str, image: &str) -> FlotillaResult<()> {
        info!("[{}] pulling image {}", node_ip, image);
        self.post(
            node_ip,
            &format!("/images/{}/pull", image),
            None,
            PULL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn upload_archive(
        &self,
        node_ip: &str,
        archive: &[u8],
        extract_path: &str,
    ) -> FlotillaResult<()> {
        let upload_id = Uuid::new_v4().to_string();
        let total_chunks = archive.len().div_ceil(CHUNK_SIZE).max(1);
        info!(
            "[{}] uploading {:.2} MiB in {} chunk(s) to {}",
            node_ip,
            archive.len() as f64 / 1024.0 / 1024.0,
            total_chunks,
            extract_path
        );

        for chunk_index in 0..total_chunks {
            let start = chunk_index * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(archive.len());
            let body = json!({
                "upload_id": upload_id,
                "chunk_index": chunk_index,
                "total_chunks": total_chunks,
                "chunk_data": BASE64.encode(&archive[start..end]),
                "extract_path": extract_path,
            });

            let response = self
                .post(node_ip, "/upload/tar/chunked", Some(body), CHUNK_TIMEOUT)
                .await?;
            let status = response.get("status").and_then(Value::as_str);
            let last = chunk_index == total_chunks - 1;
            match (last, status) {
                (true, Some("complete")) => {}
                (false, Some("chunk_received")) => {}
                _ => {
                    return Err(FlotillaError::Agent(format!(
                        "[{}] unexpected chunk {}/{} response: {:?}",
                        node_ip,
                        chunk_index + 1,
                        total_chunks,
                        status
                    )));
                }
            }
        }
        Ok(())
    }

    async fn ensure_network(&self, node_ip: &str, network: &str) -> FlotillaResult<()> {
        let response = self
            .post(
                node_ip,
                &format!("/networks/{}/create", network),
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        debug!(
            "[{}] network {}: {}",
            node_ip,
            network,
            response
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("created")
        );
        Ok(())
    }

    async fn ensure_volume(&self, node_ip: &str, volume: &str) -> FlotillaResult<()> {
        self.post(
            node_ip,
            &format!("/volumes/{}/create", volume),
            None,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn runtime_alive(&self, node_ip: &str) -> bool {
        self.http
            .get(self.url(node_ip, "/containers"))
            .timeout(LIVENESS_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Build a gzipped tar of the given subdirectories under `root`, with paths
/// stored relative to `root`. Extracting the result twice yields the same
/// tree, which is what makes the pre-deploy push idempotent.
pub async fn build_payload_archive(root: PathBuf, dirs: Vec<String>) -> FlotillaResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> FlotillaResult<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for dir in &dirs {
            let path = root.join(dir);
            if !path.is_dir() {
                debug!("payload: skipping {} (not present)", path.display());
                continue;
            }
            builder
                .append_dir_all(Path::new(dir), &path)
                .map_err(|e| FlotillaError::State(format!("archiving {}: {}", dir, e)))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| FlotillaError::State(format!("finalizing archive: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| FlotillaError::State(format!("compressing archive: {}", e)))
    })
    .await
    .map_err(|e| FlotillaError::Internal(format!("archive task: {}", e)))?
}

/// Directories pushed to every candidate node before a deploy.
pub const PAYLOAD_DIRS: [&str; 3] = ["config", "secrets", "files"];

/// Push the local payload tree for a project env to one node.
pub async fn push_payload(
    agent: &dyn NodeAgent,
    node_ip: &str,
    local_root: &Path,
    extract_path: &str,
) -> FlotillaResult<()> {
    let archive = build_payload_archive(
        local_root.to_path_buf(),
        PAYLOAD_DIRS.iter().map(|d| d.to_string()).collect(),
    )
    .await?;
    if archive.is_empty() {
        warn!("[{}] payload archive is empty, pushing anyway", node_ip);
    }
    agent.upload_archive(node_ip, &archive, extract_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn payload_archive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::create_dir_all(dir.path().join("secrets")).unwrap();
        std::fs::write(dir.path().join("config/app.toml"), b"port = 80").unwrap();
        std::fs::write(dir.path().join("secrets/db.pass"), b"hunter2").unwrap();

        let archive = build_payload_archive(
            dir.path().to_path_buf(),
            PAYLOAD_DIRS.iter().map(|d| d.to_string()).collect(),
        )
        .await
        .unwrap();

        let mut decoder = GzDecoder::new(&archive[..]);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw).unwrap();
        let mut tar = tar::Archive::new(&raw[..]);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(names.iter().any(|n| n == "config/app.toml"));
        assert!(names.iter().any(|n| n == "secrets/db.pass"));
        // files/ is absent locally and silently skipped
        assert!(!names.iter().any(|n| n.starts_with("files")));
    }

    #[test]
    fn chunk_arithmetic_covers_small_and_large() {
        assert_eq!(0usize.div_ceil(CHUNK_SIZE).max(1), 1);
        assert_eq!((CHUNK_SIZE - 1).div_ceil(CHUNK_SIZE), 1);
        assert_eq!((CHUNK_SIZE + 1).div_ceil(CHUNK_SIZE), 2);
    }
}
