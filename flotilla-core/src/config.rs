use crate::cron;
use crate::error::{FlotillaError, FlotillaResult};
use crate::tiers;
use crate::types::{ServiceId, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Environment variable carrying the IaaS API token.
pub const CLOUD_TOKEN_ENV: &str = "FLOTILLA_CLOUD_TOKEN";
/// Environment variable carrying the image registry token.
pub const REGISTRY_TOKEN_ENV: &str = "FLOTILLA_REGISTRY_TOKEN";
/// Environment variable carrying the SMTP password for alerts.
pub const SMTP_PASSWORD_ENV: &str = "FLOTILLA_SMTP_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlotillaConfig {
    /// Owner of every deployment this control plane manages
    pub user: String,
    /// Registry account image references are pushed under
    pub registry_account: String,
    /// Registry token sealed with the cloud API token; plain tokens come
    /// from the environment instead
    #[serde(default)]
    pub registry_token_sealed: Option<String>,
    /// Path of the persisted deployment index
    pub state_path: String,
    pub cloud: CloudConfig,
    pub daemon: DaemonConfig,
    pub alerts: Option<AlertConfig>,
    #[serde(default)]
    pub projects: HashMap<String, ProjectSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub api_base: String,
    /// Tag marking nodes as managed by this control plane
    pub fleet_tag: String,
    pub default_zone: String,
    /// Base OS image for provisioned nodes
    pub node_image: String,
    pub ssh_key_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub heal_interval_secs: u64,
    pub scale_check_interval_secs: u64,
    /// Never replace nodes once the healthy count drops to this
    pub min_healthy: usize,
    pub lock_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// Version tag built images carry, and the version deploys record
    #[serde(default = "default_version")]
    pub version: String,
    /// env name → service name → spec
    #[serde(default)]
    pub environments: HashMap<String, HashMap<String, ServiceSpec>>,
}

fn default_version() -> String {
    "latest".to_string()
}

impl Default for ProjectSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            environments: HashMap::new(),
        }
    }
}

impl Default for FlotillaConfig {
    fn default() -> Self {
        Self {
            user: "u1".to_string(),
            registry_account: "flotilla".to_string(),
            registry_token_sealed: None,
            state_path: "~/.local/share/flotilla/deployments.json".to_string(),
            cloud: CloudConfig {
                api_base: "https://api.digitalocean.com/v2".to_string(),
                fleet_tag: "deployer".to_string(),
                default_zone: "lon1".to_string(),
                node_image: "ubuntu-22-04-x64".to_string(),
                ssh_key_name: "deployer_key".to_string(),
            },
            daemon: DaemonConfig {
                heal_interval_secs: 60,
                scale_check_interval_secs: 300,
                min_healthy: 1,
                lock_ttl_secs: 600,
            },
            alerts: None,
            projects: HashMap::new(),
        }
    }
}

impl FlotillaConfig {
    pub async fn load(config_path: Option<&str>) -> FlotillaResult<Self> {
        let path = match config_path {
            Some(p) => PathBuf::from(p),
            None => {
                let config_dir = dirs::config_dir().ok_or_else(|| {
                    FlotillaError::Config("could not find config directory".to_string())
                })?;
                config_dir.join("flotilla").join("flotilla.toml")
            }
        };

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config: FlotillaConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = FlotillaConfig::default();
            config.save(&path).await?;
            Ok(config)
        }
    }

    pub async fn save(&self, path: &PathBuf) -> FlotillaResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlotillaError::Config(format!("serialize config: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Validate every declared service before any side effect happens:
    /// cron strings, capacity tiers, identifier sanity, dependency names.
    pub fn validate(&self) -> FlotillaResult<()> {
        if self.user.is_empty() {
            return Err(FlotillaError::Validation("user must not be empty".into()));
        }
        for (project, spec) in &self.projects {
            for (env, services) in &spec.environments {
                for (name, service) in services {
                    if name.contains(['_', '/', ' ']) {
                        return Err(FlotillaError::Validation(format!(
                            "service name '{}' in {}/{} may not contain '_', '/' or spaces",
                            name, project, env
                        )));
                    }
                    tiers::slug_for(service.vcpu, service.memory_mib)?;
                    if service.zones.is_empty() {
                        return Err(FlotillaError::Validation(format!(
                            "{}/{}/{} declares no zones",
                            project, env, name
                        )));
                    }
                    if let crate::types::RunMode::Scheduled(schedule) = &service.run_mode {
                        cron::validate(schedule)?;
                    }
                    for dep in &service.depends_on {
                        if !services.contains_key(dep) {
                            return Err(FlotillaError::Validation(format!(
                                "{}/{}/{} depends on unknown service '{}'",
                                project, env, name, dep
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn services(
        &self,
        project: &str,
        env: &str,
    ) -> FlotillaResult<&HashMap<String, ServiceSpec>> {
        let spec = self
            .projects
            .get(project)
            .ok_or_else(|| FlotillaError::NoSuchProject(project.to_string()))?;
        spec.environments.get(env).ok_or_else(|| {
            FlotillaError::NoSuchService(format!("{} has no environment '{}'", project, env))
        })
    }

    pub fn service_spec(
        &self,
        project: &str,
        env: &str,
        service: &str,
    ) -> FlotillaResult<&ServiceSpec> {
        self.services(project, env)?.get(service).ok_or_else(|| {
            FlotillaError::NoSuchService(format!("{}/{}/{}", project, env, service))
        })
    }

    pub fn service_id(&self, project: &str, env: &str, service: &str) -> ServiceId {
        ServiceId::new(&self.user, project, env, service)
    }

    pub fn cloud_token(&self) -> FlotillaResult<String> {
        std::env::var(CLOUD_TOKEN_ENV).map_err(|_| {
            FlotillaError::Config(format!("{} not set in environment", CLOUD_TOKEN_ENV))
        })
    }

    /// Registry credentials: the sealed token from the config file when
    /// present (opened with the cloud token), the environment otherwise.
    pub fn registry_token(&self) -> FlotillaResult<Option<String>> {
        if let Some(sealed) = &self.registry_token_sealed {
            let sealer = crate::sealer::TokenSealer::new(&self.cloud_token()?)?;
            use crate::sealer::Sealer;
            return sealer.open(sealed).map(Some);
        }
        Ok(std::env::var(REGISTRY_TOKEN_ENV).ok())
    }

    /// Seal a registry token for storage in the config file.
    pub fn seal_registry_token(&mut self, token: &str) -> FlotillaResult<()> {
        use crate::sealer::Sealer;
        let sealer = crate::sealer::TokenSealer::new(&self.cloud_token()?)?;
        self.registry_token_sealed = Some(sealer.seal(token)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageSource, RunMode};

    fn spec() -> ServiceSpec {
        ServiceSpec {
            image: ImageSource::Registry("nginx:1.25".into()),
            run_mode: RunMode::LongRunning,
            ports: vec![80],
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

    fn config_with(service: ServiceSpec) -> FlotillaConfig {
        let mut config = FlotillaConfig::default();
        let mut services = HashMap::new();
        services.insert("web".to_string(), service);
        let mut environments = HashMap::new();
        environments.insert("prod".to_string(), services);
        config.projects.insert(
            "shop".to_string(),
            ProjectSpec {
                version: "1.0.0".to_string(),
                environments,
            },
        );
        config
    }

    #[test]
    fn default_config_validates() {
        assert!(FlotillaConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_cron_rejected_at_load_time() {
        let mut service = spec();
        service.run_mode = RunMode::Scheduled("not a cron".into());
        assert!(config_with(service).validate().is_err());
    }

    #[test]
    fn off_tier_capacity_rejected() {
        let mut service = spec();
        service.memory_mib = 3000;
        assert!(config_with(service).validate().is_err());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut service = spec();
        service.depends_on = vec!["ghost".into()];
        assert!(config_with(service).validate().is_err());
    }

    #[test]
    fn missing_identities_surface_typed_errors() {
        let config = config_with(spec());
        assert!(matches!(
            config.service_spec("nope", "prod", "web"),
            Err(FlotillaError::NoSuchProject(_))
        ));
        assert!(matches!(
            config.service_spec("shop", "prod", "nope"),
            Err(FlotillaError::NoSuchService(_))
        ));
        assert!(config.service_spec("shop", "prod", "web").is_ok());
    }

    #[tokio::test]
    async fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.toml");
        let config = config_with(spec());
        config.save(&path).await.unwrap();

        let loaded = FlotillaConfig::load(Some(path.to_str().unwrap())).await.unwrap();
        assert_eq!(loaded.user, config.user);
        assert!(loaded.service_spec("shop", "prod", "web").is_ok());
    }
}
