//! Upstream provider selection and endpoint construction.
//!
//! The relay speaks one realtime event protocol to every upstream; only the
//! outer connection differs per provider:
//! - base endpoint
//! - extra handshake headers
//! - default model and voice

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::{CallError, CallResult};

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// DashScope (Qwen Omni) realtime WebSocket endpoint.
pub const DASHSCOPE_REALTIME_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/realtime";

/// Default model when neither the client nor configuration names one.
pub const DEFAULT_MODEL: &str = "qwen3-omni-flash-realtime";

/// Default voice when neither the client nor configuration names one.
pub const DEFAULT_VOICE: &str = "Cherry";

/// Default capture sample rate sent upstream.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16_000;

/// Default synthesized-speech sample rate received from upstream.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

// =============================================================================
// Providers
// =============================================================================

/// Supported upstream realtime providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProvider {
    /// OpenAI Realtime API
    OpenAI,
    /// Alibaba DashScope realtime API
    #[default]
    DashScope,
    /// Any protocol-compatible endpoint given by `base_url`
    Custom,
}

impl UpstreamProvider {
    /// Parse provider from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "dashscope" | "qwen" | "aliyun" => Some(Self::DashScope),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Built-in endpoint, `None` for `Custom`.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some(OPENAI_REALTIME_URL),
            Self::DashScope => Some(DASHSCOPE_REALTIME_URL),
            Self::Custom => None,
        }
    }

    /// Additional handshake headers required by the provider.
    pub fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::OpenAI => &[("openai-beta", "realtime=v1")],
            Self::DashScope | Self::Custom => &[],
        }
    }
}

impl std::fmt::Display for UpstreamProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::DashScope => write!(f, "dashscope"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Build `<base>?model=<model>[&voice=<voice>]`.
///
/// Query parameters already present on `base` are preserved.
pub fn build_upstream_url(base: &str, model: &str, voice: Option<&str>) -> CallResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| CallError::InvalidConfig(format!("invalid upstream URL '{base}': {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(CallError::InvalidConfig(format!(
                "upstream URL must use ws or wss, got '{other}'"
            )));
        }
    }

    if model.trim().is_empty() {
        return Err(CallError::InvalidConfig("model must not be empty".to_string()));
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("model", model);
        if let Some(voice) = voice.filter(|v| !v.is_empty()) {
            query.append_pair("voice", voice);
        }
    }

    Ok(url)
}
