//! Merge environment values with YAML overrides and apply defaults.

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use super::env::EnvConfig;
use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig};
use crate::core::protocol::UpstreamProvider;
use crate::core::relay::UpstreamSettings;

/// Build the final configuration. Priority: YAML > environment > defaults.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let env = EnvConfig::load()?;
    let yaml = yaml.unwrap_or_default();
    let defaults = ServerConfig::default();

    let server = yaml.server.unwrap_or_default();
    let mut upstream_yaml = yaml.upstream.unwrap_or_default();
    let session = yaml.session.unwrap_or_default();
    let security = yaml.security.unwrap_or_default();

    let tls = merge_tls(&env, server.tls.unwrap_or_default())?;

    let provider = match upstream_yaml.provider.take().or(env.provider.clone()) {
        Some(raw) => UpstreamProvider::parse(&raw)
            .ok_or_else(|| format!("Unknown realtime provider '{raw}'"))?,
        None => UpstreamProvider::default(),
    };

    let upstream_defaults = UpstreamSettings::default();
    let upstream = UpstreamSettings {
        provider,
        base_url: upstream_yaml.base_url.take().or(env.base_url.clone()),
        api_key: upstream_yaml
            .api_key
            .take()
            .map(Zeroizing::new)
            .or_else(|| select_env_credential(provider, &env)),
        default_model: upstream_yaml
            .model
            .take()
            .or(env.model.clone())
            .unwrap_or(upstream_defaults.default_model),
        default_voice: upstream_yaml
            .voice
            .take()
            .or(env.voice.clone())
            .unwrap_or(upstream_defaults.default_voice),
        keepalive_interval: upstream_yaml
            .keepalive_seconds
            .or(env.keepalive_seconds)
            .map(Duration::from_secs)
            .unwrap_or(upstream_defaults.keepalive_interval),
        handshake_timeout: upstream_yaml
            .handshake_timeout_seconds
            .or(env.handshake_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(upstream_defaults.handshake_timeout),
    };

    Ok(ServerConfig {
        host: server.host.or(env.host.clone()).unwrap_or(defaults.host.clone()),
        port: server.port.or(env.port).unwrap_or(defaults.port),
        tls,
        upstream,
        session_ttl_seconds: session
            .ttl_seconds
            .or(env.session_ttl_seconds)
            .unwrap_or(defaults.session_ttl_seconds),
        rate_limit_requests_per_second: security
            .rate_limit_requests_per_second
            .or(env.rate_limit_requests_per_second)
            .unwrap_or(defaults.rate_limit_requests_per_second),
        rate_limit_burst_size: security
            .rate_limit_burst_size
            .or(env.rate_limit_burst_size)
            .unwrap_or(defaults.rate_limit_burst_size),
        max_websocket_connections: security
            .max_websocket_connections
            .or(env.max_websocket_connections),
        max_connections_per_ip: security
            .max_connections_per_ip
            .or(env.max_connections_per_ip)
            .unwrap_or(defaults.max_connections_per_ip),
    })
}

/// `REALTIME_API_KEY` wins, then the key named after the provider, then the
/// other provider's key.
fn select_env_credential(provider: UpstreamProvider, env: &EnvConfig) -> Option<Zeroizing<String>> {
    let (preferred, fallback) = match provider {
        UpstreamProvider::OpenAI => (&env.openai_api_key, &env.dashscope_api_key),
        UpstreamProvider::DashScope | UpstreamProvider::Custom => {
            (&env.dashscope_api_key, &env.openai_api_key)
        }
    };
    env.realtime_api_key
        .as_ref()
        .or(preferred.as_ref())
        .or(fallback.as_ref())
        .cloned()
}

fn merge_tls(
    env: &EnvConfig,
    yaml: super::yaml::TlsYaml,
) -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    let enabled = yaml.enabled.or(env.tls_enabled).unwrap_or(false);
    if !enabled {
        return Ok(None);
    }

    let cert_path = yaml.cert_path.or(env.tls_cert_path.clone());
    let key_path = yaml.key_path.or(env.tls_key_path.clone());
    match (cert_path, key_path) {
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        })),
        _ => Err("TLS is enabled but cert_path and key_path are not both set".into()),
    }
}
