use std::fmt;

/// Error kinds the control plane distinguishes.
///
/// Transient I/O is absorbed by the retry layers inside the cloud and agent
/// clients; everything that reaches a caller is one of these.
#[derive(Debug, Clone)]
pub enum FlotillaError {
    /// Configuration file or project definition problems
    Config(String),
    /// Bad cron string, bad identifier, unknown size slug, cyclic depends_on
    Validation(String),
    /// IaaS API errors that survived retries
    Cloud(String),
    /// Node agent errors that survived retries
    Agent(String),
    /// The provider refused to provision the requested capacity
    Capacity(String),
    /// At least one blue node did not become healthy; blues were rolled back
    HealthGate { service: String, failed_ips: Vec<String> },
    /// The infrastructure lock is held by someone else
    LockHeld { holder: String },
    /// Rollback target image is not present in the registry
    MissingImage(String),
    /// Project identity does not resolve
    NoSuchProject(String),
    /// Service identity does not resolve within a known project
    NoSuchService(String),
    /// State index persistence errors
    State(String),
    /// General internal errors
    Internal(String),
}

impl fmt::Display for FlotillaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlotillaError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FlotillaError::Validation(msg) => write!(f, "Validation error: {}", msg),
            FlotillaError::Cloud(msg) => write!(f, "Cloud API error: {}", msg),
            FlotillaError::Agent(msg) => write!(f, "Node agent error: {}", msg),
            FlotillaError::Capacity(msg) => write!(f, "Capacity unavailable: {}", msg),
            FlotillaError::HealthGate { service, failed_ips } => write!(
                f,
                "Health gate failed for {}: unhealthy on [{}]",
                service,
                failed_ips.join(", ")
            ),
            FlotillaError::LockHeld { holder } => {
                write!(f, "Infrastructure lock held by {}", holder)
            }
            FlotillaError::MissingImage(image) => {
                write!(f, "Image not found in registry: {}", image)
            }
            FlotillaError::NoSuchProject(name) => write!(f, "No such project: {}", name),
            FlotillaError::NoSuchService(name) => write!(f, "No such service: {}", name),
            FlotillaError::State(msg) => write!(f, "State index error: {}", msg),
            FlotillaError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for FlotillaError {}

impl From<anyhow::Error> for FlotillaError {
    fn from(err: anyhow::Error) -> Self {
        FlotillaError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for FlotillaError {
    fn from(err: reqwest::Error) -> Self {
        FlotillaError::Agent(err.to_string())
    }
}

impl From<serde_json::Error> for FlotillaError {
    fn from(err: serde_json::Error) -> Self {
        FlotillaError::State(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for FlotillaError {
    fn from(err: toml::de::Error) -> Self {
        FlotillaError::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<std::io::Error> for FlotillaError {
    fn from(err: std::io::Error) -> Self {
        FlotillaError::State(format!("IO error: {}", err))
    }
}

/// Result type alias for control-plane operations
pub type FlotillaResult<T> = Result<T, FlotillaError>;

/// Error context helper for better error reporting
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> FlotillaResult<T>;
    fn with_cloud_context(self, context: &str) -> FlotillaResult<T>;
    fn with_agent_context(self, context: &str) -> FlotillaResult<T>;
    fn with_state_context(self, context: &str) -> FlotillaResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context(self, context: &str) -> FlotillaResult<T> {
        self.map_err(|e| FlotillaError::Internal(format!("{}: {}", context, e)))
    }

    fn with_cloud_context(self, context: &str) -> FlotillaResult<T> {
        self.map_err(|e| FlotillaError::Cloud(format!("{}: {}", context, e)))
    }

    fn with_agent_context(self, context: &str) -> FlotillaResult<T> {
        self.map_err(|e| FlotillaError::Agent(format!("{}: {}", context, e)))
    }

    fn with_state_context(self, context: &str) -> FlotillaResult<T> {
        self.map_err(|e| FlotillaError::State(format!("{}: {}", context, e)))
    }
}
