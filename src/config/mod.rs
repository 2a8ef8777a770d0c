//! Configuration module for the duplex gateway
//!
//! Configuration comes from .env files, environment variables and an optional
//! YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use duplex_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::relay::UpstreamSettings;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// The upstream credential lives in [`UpstreamSettings`] as a zeroizing
/// string: it is wiped when the configuration is dropped and never printed by
/// `Debug`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    /// Upstream realtime service: provider, endpoint, credential, defaults
    pub upstream: UpstreamSettings,

    /// Lifetime advertised by `POST /session`
    /// Default: 60
    pub session_ttl_seconds: u64,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            tls: None,
            upstream: UpstreamSettings::default(),
            session_ttl_seconds: 60,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Recognised variables: `HOST`, `PORT`, `TLS_ENABLED`, `TLS_CERT_PATH`,
    /// `TLS_KEY_PATH`, `REALTIME_PROVIDER`, `REALTIME_BASE`,
    /// `REALTIME_API_KEY` / `DASHSCOPE_API_KEY` / `OPENAI_API_KEY`,
    /// `REALTIME_MODEL`, `REALTIME_VOICE`, `RELAY_KEEPALIVE_SECS`,
    /// `RELAY_HANDSHAKE_TIMEOUT_SECS`, `SESSION_TTL_SECONDS`,
    /// `RATE_LIMIT_REQUESTS_PER_SECOND`, `RATE_LIMIT_BURST_SIZE`,
    /// `MAX_WEBSOCKET_CONNECTIONS`, `MAX_CONNECTIONS_PER_IP`.
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or the resulting
    /// configuration fails validation.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Environment variables (including values loaded from `.env` in `main`)
    /// provide the base configuration and YAML overrides specific values.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Run every validation rule against this configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validation::validate_tls(&self.tls)?;
        validation::validate_upstream(&self.upstream)?;
        validation::validate_rate_limits(
            self.rate_limit_requests_per_second,
            self.rate_limit_burst_size,
        )?;
        validation::validate_session_ttl(self.session_ttl_seconds)?;
        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether an upstream credential is configured
    pub fn has_upstream_credential(&self) -> bool {
        self.upstream.has_credential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{DEFAULT_MODEL, DEFAULT_VOICE, UpstreamProvider};
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            for name in [
                "HOST",
                "PORT",
                "TLS_ENABLED",
                "TLS_CERT_PATH",
                "TLS_KEY_PATH",
                "REALTIME_PROVIDER",
                "REALTIME_BASE",
                "REALTIME_API_KEY",
                "DASHSCOPE_API_KEY",
                "OPENAI_API_KEY",
                "REALTIME_MODEL",
                "REALTIME_VOICE",
                "RELAY_KEEPALIVE_SECS",
                "RELAY_HANDSHAKE_TIMEOUT_SECS",
                "SESSION_TTL_SECONDS",
                "RATE_LIMIT_REQUESTS_PER_SECOND",
                "RATE_LIMIT_BURST_SIZE",
                "MAX_WEBSOCKET_CONNECTIONS",
                "MAX_CONNECTIONS_PER_IP",
            ] {
                env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(!config.is_tls_enabled());
        assert_eq!(config.upstream.provider, UpstreamProvider::DashScope);
        assert_eq!(config.upstream.default_model, DEFAULT_MODEL);
        assert_eq!(config.upstream.default_voice, DEFAULT_VOICE);
        assert_eq!(config.upstream.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.upstream.handshake_timeout, Duration::from_secs(10));
        assert!(!config.has_upstream_credential());
        assert_eq!(config.session_ttl_seconds, 60);
        assert_eq!(config.max_websocket_connections, None);
        assert_eq!(config.max_connections_per_ip, 100);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("HOST", "127.0.0.1");
            env::set_var("PORT", "8787");
            env::set_var("REALTIME_PROVIDER", "openai");
            env::set_var("OPENAI_API_KEY", "sk-openai");
            env::set_var("DASHSCOPE_API_KEY", "sk-dashscope");
            env::set_var("REALTIME_VOICE", "alloy");
            env::set_var("RELAY_KEEPALIVE_SECS", "5");
            env::set_var("MAX_WEBSOCKET_CONNECTIONS", "25");
        }

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.address(), "127.0.0.1:8787");
        assert_eq!(config.upstream.provider, UpstreamProvider::OpenAI);
        // provider-specific key preferred over the other provider's key
        assert_eq!(
            config.upstream.api_key.as_deref().map(String::as_str),
            Some("sk-openai")
        );
        assert_eq!(config.upstream.default_voice, "alloy");
        assert_eq!(config.upstream.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.max_websocket_connections, Some(25));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_realtime_api_key_takes_precedence() {
        cleanup_env_vars();
        unsafe {
            env::set_var("REALTIME_API_KEY", "sk-generic");
            env::set_var("DASHSCOPE_API_KEY", "sk-dashscope");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(
            config.upstream.api_key.as_deref().map(String::as_str),
            Some("sk-generic")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_unknown_provider() {
        cleanup_env_vars();
        unsafe {
            env::set_var("REALTIME_PROVIDER", "carrier-pigeon");
        }

        let result = ServerConfig::from_env();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("carrier-pigeon"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_custom_provider_requires_base() {
        cleanup_env_vars();
        unsafe {
            env::set_var("REALTIME_PROVIDER", "custom");
        }
        assert!(ServerConfig::from_env().is_err());

        unsafe {
            env::set_var("REALTIME_BASE", "ws://127.0.0.1:9100/realtime");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(
            config.upstream.endpoint().unwrap(),
            "ws://127.0.0.1:9100/realtime"
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

upstream:
  api_key: "yaml-key"
  model: "yaml-model"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("REALTIME_API_KEY", "env-key");
            env::set_var("REALTIME_VOICE", "Ethan");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(
            config.upstream.api_key.as_deref().map(String::as_str),
            Some("yaml-key")
        );
        assert_eq!(config.upstream.default_model, "yaml-model");
        // ENV value where YAML is silent
        assert_eq!(config.upstream.default_voice, "Ethan");
        assert_eq!(config.port, 8080);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_tls_requires_existing_files() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let cert_path = temp_dir.path().join("cert.pem");
        let key_path = temp_dir.path().join("key.pem");

        let yaml_content = format!(
            "server:\n  tls:\n    enabled: true\n    cert_path: \"{}\"\n    key_path: \"{}\"\n",
            cert_path.display(),
            key_path.display()
        );
        fs::write(&config_path, &yaml_content).unwrap();

        // files do not exist yet
        assert!(ServerConfig::from_file(&config_path).is_err());

        fs::write(&cert_path, "fake cert").unwrap();
        fs::write(&key_path, "fake key").unwrap();
        let config = ServerConfig::from_file(&config_path).unwrap();
        assert!(config.is_tls_enabled());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_zero_rate_limit() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "security:\n  rate_limit_requests_per_second: 0\n",
        )
        .unwrap();

        assert!(ServerConfig::from_file(&config_path).is_err());

        cleanup_env_vars();
    }

    #[test]
    fn test_debug_never_prints_credential() {
        let mut config = ServerConfig::default();
        config.upstream.api_key = Some(zeroize::Zeroizing::new("sk-live-123".to_string()));
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-live-123"));
    }
}
