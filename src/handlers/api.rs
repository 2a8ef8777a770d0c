use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;

/// Liveness probe body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// Unix time in milliseconds
    pub ts: i64,
}

/// `GET /health`
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        ts: unix_millis(),
    })
}

pub(crate) fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
