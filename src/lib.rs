pub mod ai;
pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod health;
pub mod plans;
pub mod rate_limit;
pub mod routes;
pub mod tool_sessions;
pub mod tools;

pub use config::{integration_config_from_env, IntegrationConfig};
pub use routes::{build_app, AppServices};
