pub mod admin;
pub mod auth;
pub mod config;
pub mod connection;
pub mod identity;
pub mod presence;
pub mod registry;
pub mod server;
pub mod service;
pub mod visitor;

pub use config::{ConfigError, ServerConfig};
pub use presence::{PresenceCoordinator, PresenceSnapshot};
pub use server::{start, AppState, ServerHandle, StartError};
pub use service::PresenceService;
