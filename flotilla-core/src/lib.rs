pub mod config;
pub mod cron;
pub mod error;
pub mod local;
pub mod metrics;
pub mod naming;
pub mod ops;
pub mod paths;
pub mod sealer;
pub mod state;
pub mod tiers;
pub mod types;

pub use config::FlotillaConfig;
pub use error::{FlotillaError, FlotillaResult};
pub use metrics::{MetricKey, MetricsRing};
pub use sealer::{Sealer, TokenSealer};
pub use state::StateIndex;
pub use types::*;
