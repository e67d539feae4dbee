pub mod agent;
pub mod cloud;
pub mod inventory;
pub mod lock;
pub mod notify;

pub use agent::HttpAgent;
pub use cloud::OceanClient;
pub use inventory::InventoryStore;
pub use lock::LockManager;
pub use notify::{LogNotifier, SmtpNotifier};
