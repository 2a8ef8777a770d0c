//! Session bootstrap
//!
//! `POST /session` tells a client which model and voice it will get and where
//! to open the relay socket. No upstream token is issued: the relay holds the
//! credential.

use std::sync::Arc;

use axum::{Json, body::Bytes, extract::State};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Path of the relay WebSocket endpoint
pub const RELAY_PATH: &str = "/realtime/ws";

/// Modalities requested from the upstream model
pub const SESSION_MODALITIES: [&str; 2] = ["audio", "text"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeParams {
    pub model: String,
    pub voice: String,
    pub modalities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    /// Unix time in seconds
    pub expires_at: i64,
    pub realtime: RealtimeParams,
    /// Relay URL path including the negotiated query
    pub relay_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// `POST /session`
///
/// An empty body is the same as `{}`. Anything else must be a JSON object
/// whose fields are strings when present.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> AppResult<Json<SessionResponse>> {
    let request: SessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };

    let upstream = &state.config.upstream;
    let model = upstream.resolve_model(request.model.as_deref()).to_string();
    let voice = upstream.resolve_voice(request.voice.as_deref()).to_string();

    let relay_path = format!(
        "{RELAY_PATH}?{}",
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("model", &model)
            .append_pair("voice", &voice)
            .finish()
    );

    let response = SessionResponse {
        session_id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
        expires_at: OffsetDateTime::now_utc().unix_timestamp()
            + state.config.session_ttl_seconds as i64,
        realtime: RealtimeParams {
            model,
            voice,
            modalities: SESSION_MODALITIES.iter().map(|m| m.to_string()).collect(),
        },
        relay_path,
        client_id: request.client_id,
    };

    info!(
        session_id = %response.session_id,
        model = %response.realtime.model,
        voice = %response.realtime.voice,
        "Session created"
    );

    Ok(Json(response))
}
