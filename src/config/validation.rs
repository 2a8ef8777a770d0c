use super::TlsConfig;
use crate::core::relay::UpstreamSettings;

/// Certificate and key files must exist when TLS is enabled.
pub(super) fn validate_tls(tls: &Option<TlsConfig>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(tls) = tls {
        if !tls.cert_path.exists() {
            return Err(format!(
                "TLS certificate file not found: {}",
                tls.cert_path.display()
            )
            .into());
        }
        if !tls.key_path.exists() {
            return Err(format!("TLS key file not found: {}", tls.key_path.display()).into());
        }
    }
    Ok(())
}

/// Endpoint and timers must be usable. A missing credential is not an error
/// at startup: the relay reports it per connection.
pub(super) fn validate_upstream(
    upstream: &UpstreamSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    upstream.validate()?;
    let endpoint = upstream.endpoint()?;
    let url = url::Url::parse(endpoint)
        .map_err(|e| format!("Invalid upstream base URL '{endpoint}': {e}"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(format!("Upstream base URL must use ws:// or wss://, got '{endpoint}'").into());
    }
    Ok(())
}

pub(super) fn validate_rate_limits(
    requests_per_second: u32,
    burst_size: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if requests_per_second == 0 {
        return Err("rate_limit_requests_per_second must be greater than zero".into());
    }
    if burst_size == 0 {
        return Err("rate_limit_burst_size must be greater than zero".into());
    }
    Ok(())
}

pub(super) fn validate_session_ttl(ttl_seconds: u64) -> Result<(), Box<dyn std::error::Error>> {
    if ttl_seconds == 0 {
        return Err("session ttl_seconds must be greater than zero".into());
    }
    Ok(())
}
