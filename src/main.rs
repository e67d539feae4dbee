use anyhow::Result;
use clap::{Parser, Subcommand};
use flotilla_core::config::FlotillaConfig;
use flotilla_core::ops::CommandRunner;
use flotilla_core::state::StateIndex;
use flotilla_core::types::DeploymentStatus;
use flotilla_deploy::{Deployer, LogGateway, RegistryProbe, ScheduledJobInstaller, ShellImageBuilder};
use flotilla_infra::{HttpAgent, InventoryStore, LockManager, OceanClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::Level;

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Deploy containerized services across a pool of cloud nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a project environment (or a single service)
    Deploy {
        #[arg(long)]
        project: String,
        #[arg(long)]
        env: String,
        #[arg(long)]
        service: Option<String>,
        /// Pin the image version instead of the project's configured one
        #[arg(long)]
        version: Option<String>,
        /// Skip the image build phase
        #[arg(long)]
        no_build: bool,
    },
    /// Roll a service back to an earlier version from its history
    Rollback {
        #[arg(long)]
        project: String,
        #[arg(long)]
        env: String,
        #[arg(long)]
        service: String,
        /// Target version (defaults to the one before current)
        #[arg(long)]
        version: Option<String>,
    },
    /// Show fleet and deployment state
    Status {
        #[arg(long)]
        env: Option<String>,
    },
    /// Tail a service's container logs
    Logs {
        #[arg(long)]
        project: String,
        #[arg(long)]
        env: String,
        #[arg(long)]
        service: String,
        #[arg(long, default_value_t = 100)]
        lines: u32,
    },
    /// List managed nodes
    Servers {
        /// Filter by deployment status (reserve, blue, green, destroying)
        #[arg(long)]
        status: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the active configuration
    Show,
    /// Write a default configuration file
    Init,
    /// Seal a registry token with the cloud API token and store it
    SealToken { token: String },
}

/// Everything a CLI command needs, wired once.
struct App {
    config: Arc<RwLock<FlotillaConfig>>,
    inventory: Arc<InventoryStore>,
    state: Arc<StateIndex>,
    agent: Arc<HttpAgent>,
    deployer: Deployer,
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

async fn build_app(config: FlotillaConfig) -> Result<App> {
    let token = config.cloud_token()?;
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
    let state = Arc::new(StateIndex::load(expand_path(&config.state_path)).await?);
    let lock = Arc::new(LockManager::new(cloud.clone(), config.daemon.lock_ttl_secs));
    let runner: Arc<dyn CommandRunner> = Arc::new(flotilla_core::local::LocalRunner);
    let installer = Arc::new(ScheduledJobInstaller::new(runner.clone(), &config.user));
    let builder = Arc::new(ShellImageBuilder::new(runner, "."));
    let actor = format!("cli:{}", config.user);

    let config = Arc::new(RwLock::new(config));
    let deployer = Deployer::new(
        config.clone(),
        inventory.clone(),
        state.clone(),
        agent.clone(),
        lock,
        installer,
        Some(builder),
        Some(Arc::new(LogGateway)),
        &actor,
    );

    Ok(App {
        config,
        inventory,
        state,
        agent,
        deployer,
    })
}

async fn run(cli: Cli) -> Result<i32> {
    let config = FlotillaConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Deploy {
            project,
            env,
            service,
            version,
            no_build,
        } => {
            let app = build_app(config).await?;
            let summary = app
                .deployer
                .deploy(
                    &project,
                    &env,
                    service.as_deref(),
                    !no_build,
                    version.as_deref(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.succeeded() { 0 } else { EXIT_FAILURE })
        }

        Commands::Rollback {
            project,
            env,
            service,
            version,
        } => {
            let app = build_app(config).await?;
            let probe = RegistryProbe::default();
            let summary = flotilla_deploy::rollback(
                &app.deployer,
                &probe,
                &project,
                &env,
                &service,
                version.as_deref(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.succeeded() { 0 } else { EXIT_FAILURE })
        }

        Commands::Status { env } => {
            let app = build_app(config).await?;
            app.inventory.reconcile().await?;
            let summary = app.inventory.summary().await;
            println!("Fleet:");
            for status in DeploymentStatus::all() {
                println!("  {:<11} {}", status.to_string(), summary[&status]);
            }
            println!("\nDeployments:");
            let mut records = app.state.all_current().await;
            records.retain(|r| env.as_deref().is_none_or(|e| r.service.env == e));
            if records.is_empty() {
                println!("  (none)");
            }
            for record in records {
                println!(
                    "  {}  v{}  on {}  [{}]",
                    record.service,
                    record.version,
                    record.node_ips.join(", "),
                    record.deployed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(0)
        }

        Commands::Logs {
            project,
            env,
            service,
            lines,
        } => {
            let app = build_app(config).await?;
            let id = {
                let config = app.config.read().await;
                config.service_id(&project, &env, &service)
            };
            let Some(record) = app.state.current(&id).await else {
                eprintln!("no current deployment for {}", id);
                return Ok(EXIT_FAILURE);
            };
            let Some(ip) = record.node_ips.first() else {
                eprintln!("{} has no nodes recorded", id);
                return Ok(EXIT_FAILURE);
            };
            use flotilla_core::ops::NodeAgent;
            let logs = app
                .agent
                .container_logs(ip, &record.container_name, lines)
                .await?;
            println!("{}", logs);
            Ok(0)
        }

        Commands::Servers { status } => {
            let app = build_app(config).await?;
            app.inventory.reconcile().await?;
            let mut nodes = app.inventory.all().await;
            if let Some(filter) = status {
                nodes.retain(|n| n.status.to_string() == filter);
            }
            nodes.sort_by(|a, b| a.public_ip.cmp(&b.public_ip));
            for node in nodes {
                println!(
                    "{:<16} {:<11} {:<8} {:>2} vCPU {:>6} MiB  {}",
                    node.public_ip, node.status.to_string(), node.zone, node.vcpu, node.memory_mib, node.name
                );
            }
            Ok(0)
        }

        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(0)
            }
            ConfigCommands::Init => {
                let path = dirs::config_dir()
                    .ok_or_else(|| anyhow::anyhow!("could not find config directory"))?
                    .join("flotilla")
                    .join("flotilla.toml");
                FlotillaConfig::default().save(&path).await?;
                println!("wrote {}", path.display());
                Ok(0)
            }
            ConfigCommands::SealToken { token } => {
                let mut config = config;
                config.seal_registry_token(&token)?;
                let path = match cli.config.as_deref() {
                    Some(p) => PathBuf::from(p),
                    None => dirs::config_dir()
                        .ok_or_else(|| anyhow::anyhow!("could not find config directory"))?
                        .join("flotilla")
                        .join("flotilla.toml"),
                };
                config.save(&path).await?;
                println!("registry token sealed into {}", path.display());
                Ok(0)
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let code = tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {:#}", e);
                EXIT_FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            EXIT_INTERRUPTED
        }
    };
    std::process::exit(code);
}
