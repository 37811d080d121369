use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_pass: SecretString,
    /// Server-wide secret mixed into every minted token.
    pub salt: SecretString,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_send_queue: usize,
    /// Fresh draws `mint` makes before giving up.
    pub mint_attempts: u32,
    pub admin_path: String,
    pub visitor_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            admin_user: String::new(),
            admin_pass: SecretString::from(String::new()),
            salt: generate_salt(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(15),
            max_send_queue: 256,
            mint_attempts: 16,
            admin_path: "/admin".into(),
            visitor_path: "/visitor".into(),
        }
    }
}

impl ServerConfig {
    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_user.trim().is_empty() || self.admin_pass.expose_secret().is_empty() {
            return Err(ConfigError::MissingAdminCredentials);
        }
        if self.salt.expose_secret().is_empty() {
            return Err(ConfigError::EmptySalt);
        }
        if self.mint_attempts == 0 {
            return Err(ConfigError::Invalid("mint_attempts must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be non-zero".into()));
        }
        if self.max_send_queue == 0 {
            return Err(ConfigError::Invalid("max_send_queue must be at least 1".into()));
        }
        if self.admin_path == self.visitor_path {
            return Err(ConfigError::Invalid(format!(
                "admin and visitor endpoints share the path {}",
                self.admin_path
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("admin username and password must both be set")]
    MissingAdminCredentials,
    #[error("token salt must not be empty")]
    EmptySalt,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 32 random bytes, base64-encoded.
pub fn generate_salt() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretString::from(STANDARD.encode(bytes))
}
