/*!
 * Flotilla Daemon (flotillad) - Resident fleet supervisor
 *
 * Runs on every managed node. Each cycle it health-checks the green fleet,
 * elects the lowest healthy IP as leader, and lets the leader replace failed
 * nodes and evaluate auto-scaling. Followers only observe and collect
 * metrics; all topology mutation is serialized through the infrastructure
 * lock, so a second would-be leader finds the work already done.
 */

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use flotilla_core::config::FlotillaConfig;
use flotilla_core::metrics::MetricsRing;
use flotilla_core::ops::{CommandRunner, Notifier};
use flotilla_core::state::StateIndex;
use flotilla_deploy::{Deployer, Healer, LogGateway, ScalingCoordinator, ScheduledJobInstaller};
use flotilla_infra::{HttpAgent, InventoryStore, LockManager, LogNotifier, OceanClient, SmtpNotifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio::time::{Duration, interval};
use tracing::{error, info, warn};

struct FlotillaDaemon {
    config: Arc<RwLock<FlotillaConfig>>,
    healer: Healer,
    scaler: ScalingCoordinator,
    my_ip: String,
    running: Arc<AtomicBool>,
    pid_file: Option<PathBuf>,
}

fn detect_my_ip() -> String {
    if let Ok(ip) = std::env::var("SERVER_IP") {
        return ip;
    }
    // route towards a public address to learn our own; nothing is sent
    match std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|_| s))
        .and_then(|s| s.local_addr())
    {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            warn!("could not detect own IP: {}", e);
            "unknown".to_string()
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl FlotillaDaemon {
    async fn new(config_path: Option<PathBuf>, pid_file: Option<PathBuf>) -> Result<Self> {
        info!("Initializing flotilla daemon...");

        let config = FlotillaConfig::load(config_path.as_deref().and_then(|p| p.to_str()))
            .await
            .context("Failed to load config")?;

        let token = config.cloud_token().context("cloud API token missing")?;
        let cloud = Arc::new(OceanClient::new(
            &config.cloud.api_base,
            &token,
            &config.cloud.node_image,
            &config.cloud.ssh_key_name,
        )?);
        let agent = Arc::new(HttpAgent::default());
        let inventory = Arc::new(InventoryStore::new(
            cloud.clone(),
            &config.cloud.fleet_tag,
            None,
        ));
        let state_path = expand_path(&config.state_path);
        let state = Arc::new(
            StateIndex::load(&state_path)
                .await
                .context("Failed to load deployment index")?,
        );
        let metrics = Arc::new(MetricsRing::new());
        let lock = Arc::new(LockManager::new(cloud.clone(), config.daemon.lock_ttl_secs));

        let notifier: Arc<dyn Notifier> = match &config.alerts {
            Some(alerts) => match SmtpNotifier::from_config(alerts) {
                Ok(smtp) => Arc::new(smtp),
                Err(e) => {
                    warn!("SMTP alerts unavailable ({}), falling back to log", e);
                    Arc::new(LogNotifier)
                }
            },
            None => Arc::new(LogNotifier),
        };

        let my_ip = detect_my_ip();
        let runner: Arc<dyn CommandRunner> = Arc::new(flotilla_core::local::LocalRunner);
        let installer = Arc::new(ScheduledJobInstaller::new(runner.clone(), &config.user));
        let min_healthy = config.daemon.min_healthy;

        let config = Arc::new(RwLock::new(config));
        let deployer = Arc::new(Deployer::new(
            config.clone(),
            inventory.clone(),
            state.clone(),
            agent.clone(),
            lock.clone(),
            installer,
            None,
            Some(Arc::new(LogGateway)),
            &my_ip,
        ));

        let history_path = state_path
            .parent()
            .map(|p| p.join("replacements.json"))
            .unwrap_or_else(|| PathBuf::from("replacements.json"));

        let healer = Healer::new(
            &my_ip,
            config.clone(),
            inventory,
            state,
            agent,
            lock.clone(),
            notifier,
            runner,
            deployer.clone(),
            metrics.clone(),
            history_path,
            min_healthy,
        );
        let scaler = ScalingCoordinator::new(config.clone(), deployer, metrics, lock);

        Ok(Self {
            config,
            healer,
            scaler,
            my_ip,
            running: Arc::new(AtomicBool::new(false)),
            pid_file,
        })
    }

    async fn start(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file {
            tokio::fs::write(pid_file, std::process::id().to_string())
                .await
                .with_context(|| format!("writing pid file {:?}", pid_file))?;
        }

        let (heal_interval, scale_interval) = {
            let config = self.config.read().await;
            (
                config.daemon.heal_interval_secs,
                Duration::from_secs(config.daemon.scale_check_interval_secs),
            )
        };
        info!(
            "flotillad started on {} (cycle every {}s)",
            self.my_ip, heal_interval
        );
        self.running.store(true, Ordering::SeqCst);

        let mut ticker = interval(Duration::from_secs(heal_interval));
        let mut last_scale: Option<tokio::time::Instant> = None;
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.healer.run_cycle().await {
                        Ok(true) => {
                            // leader-only work: auto-scaling on its own cadence
                            if last_scale.is_none_or(|t| t.elapsed() >= scale_interval) {
                                if let Err(e) = self.scaler.run_cycle(&self.my_ip).await {
                                    error!("auto-scaling cycle failed: {}", e);
                                }
                                last_scale = Some(tokio::time::Instant::now());
                            }
                        }
                        Ok(false) => {}
                        Err(e) => error!("heal cycle failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        if let Some(pid_file) = &self.pid_file {
            let _ = tokio::fs::remove_file(pid_file).await;
        }
        info!("flotillad stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("flotillad")
        .about("Flotilla fleet supervisor daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to flotilla.toml"),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("Write the daemon pid here"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let pid_file = matches.get_one::<String>("pid-file").map(PathBuf::from);

    let daemon = FlotillaDaemon::new(config_path, pid_file).await?;
    daemon.start().await
}
