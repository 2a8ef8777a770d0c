//! Environment variable loading.
//!
//! Every field is optional here; defaults are applied in `merge`.

use std::env;
use std::str::FromStr;

use zeroize::Zeroizing;

/// Raw values read from the process environment.
#[derive(Default)]
pub(super) struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls_enabled: Option<bool>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub realtime_api_key: Option<Zeroizing<String>>,
    pub dashscope_api_key: Option<Zeroizing<String>>,
    pub openai_api_key: Option<Zeroizing<String>>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub keepalive_seconds: Option<u64>,
    pub handshake_timeout_seconds: Option<u64>,

    pub session_ttl_seconds: Option<u64>,

    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl EnvConfig {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            host: string_var("HOST"),
            port: parse_var("PORT")?,
            tls_enabled: parse_bool_var("TLS_ENABLED")?,
            tls_cert_path: string_var("TLS_CERT_PATH"),
            tls_key_path: string_var("TLS_KEY_PATH"),

            provider: string_var("REALTIME_PROVIDER"),
            base_url: string_var("REALTIME_BASE"),
            realtime_api_key: secret_var("REALTIME_API_KEY"),
            dashscope_api_key: secret_var("DASHSCOPE_API_KEY"),
            openai_api_key: secret_var("OPENAI_API_KEY"),
            model: string_var("REALTIME_MODEL"),
            voice: string_var("REALTIME_VOICE"),
            keepalive_seconds: parse_var("RELAY_KEEPALIVE_SECS")?,
            handshake_timeout_seconds: parse_var("RELAY_HANDSHAKE_TIMEOUT_SECS")?,

            session_ttl_seconds: parse_var("SESSION_TTL_SECONDS")?,

            rate_limit_requests_per_second: parse_var("RATE_LIMIT_REQUESTS_PER_SECOND")?,
            rate_limit_burst_size: parse_var("RATE_LIMIT_BURST_SIZE")?,
            max_websocket_connections: parse_var("MAX_WEBSOCKET_CONNECTIONS")?,
            max_connections_per_ip: parse_var("MAX_CONNECTIONS_PER_IP")?,
        })
    }
}

/// Non-empty, trimmed value of `name`.
fn string_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secret_var(name: &str) -> Option<Zeroizing<String>> {
    string_var(name).map(Zeroizing::new)
}

fn parse_var<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match string_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name} '{raw}': {e}").into()),
        None => Ok(None),
    }
}

fn parse_bool_var(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match string_var(name) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid value for {name} '{raw}': expected a boolean").into()),
        },
        None => Ok(None),
    }
}
