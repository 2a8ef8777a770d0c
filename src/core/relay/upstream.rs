//! Upstream connection: endpoint, credential and handshake.

use std::time::Duration;

use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::core::error::{CallError, CallResult};
use crate::core::protocol::{DEFAULT_MODEL, DEFAULT_VOICE, UpstreamProvider, build_upstream_url};

/// Connected upstream socket.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default keepalive ping interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

/// Default upstream handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How to reach the upstream realtime service.
///
/// The credential is wiped from memory when dropped and redacted from `Debug`.
#[derive(Clone)]
pub struct UpstreamSettings {
    pub provider: UpstreamProvider,
    /// Overrides the provider's built-in endpoint; required for `Custom`
    pub base_url: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    pub default_model: String,
    pub default_voice: String,
    pub keepalive_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            provider: UpstreamProvider::default(),
            base_url: None,
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            keepalive_interval: DEFAULT_KEEPALIVE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("default_model", &self.default_model)
            .field("default_voice", &self.default_voice)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl UpstreamSettings {
    /// Endpoint used for this provider.
    pub fn endpoint(&self) -> CallResult<&str> {
        if let Some(base) = self.base_url.as_deref().filter(|b| !b.is_empty()) {
            return Ok(base);
        }
        self.provider.default_base_url().ok_or_else(|| {
            CallError::InvalidConfig(format!("provider '{}' needs a base URL", self.provider))
        })
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Pick the model, falling back to the configured default.
    pub fn resolve_model<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    /// Pick the voice, falling back to the configured default.
    pub fn resolve_voice<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.default_voice.as_str())
    }

    /// Check everything `connect` needs before any network I/O.
    pub fn validate(&self) -> CallResult<()> {
        self.endpoint()?;
        if self.keepalive_interval.is_zero() {
            return Err(CallError::InvalidConfig(
                "keepalive interval must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(CallError::InvalidConfig(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Open the upstream socket for `model` / `voice`.
///
/// Fails with [`CallError::AuthMissing`] before touching the network when no
/// credential is configured, and with [`CallError::UpstreamUnreachable`] when
/// the handshake fails or exceeds the configured timeout.
pub async fn connect_upstream(
    settings: &UpstreamSettings,
    model: &str,
    voice: Option<&str>,
) -> CallResult<UpstreamSocket> {
    let api_key = settings
        .api_key
        .as_ref()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .ok_or(CallError::AuthMissing)?;

    let url = build_upstream_url(settings.endpoint()?, model, voice)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| CallError::InvalidConfig(format!("invalid upstream request: {e}")))?;

    let headers = request.headers_mut();
    let bearer = Zeroizing::new(format!("Bearer {api_key}"));
    let mut auth = HeaderValue::from_str(&bearer)
        .map_err(|_| CallError::InvalidConfig("credential is not a valid header value".into()))?;
    auth.set_sensitive(true);
    headers.insert(http::header::AUTHORIZATION, auth);
    for (name, value) in settings.provider.extra_headers() {
        headers.insert(*name, HeaderValue::from_static(value));
    }

    debug!(
        provider = %settings.provider,
        host = url.host_str().unwrap_or_default(),
        model = model,
        "Connecting to upstream"
    );

    let (socket, response) =
        tokio::time::timeout(settings.handshake_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                CallError::UpstreamUnreachable(format!(
                    "handshake timed out after {:?}",
                    settings.handshake_timeout
                ))
            })?
            .map_err(|e| CallError::UpstreamUnreachable(e.to_string()))?;

    info!(
        provider = %settings.provider,
        model = model,
        status = response.status().as_u16(),
        "Upstream connected"
    );

    Ok(socket)
}
