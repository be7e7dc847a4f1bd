pub mod config;
pub mod error;
pub mod server;
pub mod signals;
pub mod supervisor;

// Re-exports for main.rs and embedding applications
pub use crate::config::{FileSettingsStore, Settings, SettingsStore};
pub use crate::error::{ProvisionError, ServerError, SettingsError};
pub use crate::supervisor::{run_server, RestartSource, Supervisor, SupervisorContext};
