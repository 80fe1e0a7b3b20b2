//! Cadence voice agent: backend connection, session orchestration and
//! process configuration.

pub mod background;
pub mod backend;
pub mod backoff;
pub mod config;
pub mod manager;

pub use backend::{BackendClient, BackendError, InboundEvent};
pub use config::{load_config, Config, ConfigError};
pub use manager::{ManagerError, SessionManager};
