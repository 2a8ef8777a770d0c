//! Gateway instances for integration tests
//!
//! Each server binds an ephemeral port, serves the full router with connect
//! info (the relay route's connection limits need the peer address) and
//! stops when its state's shutdown token is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;
use zeroize::Zeroizing;

use duplex_gateway::{
    ServerConfig,
    core::{UpstreamProvider, UpstreamSettings},
    routes,
    state::AppState,
};

/// Config pointing the relay at a (mock) upstream.
pub fn relay_config(upstream_url: &str, api_key: Option<&str>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream: UpstreamSettings {
            provider: UpstreamProvider::Custom,
            base_url: Some(upstream_url.to_string()),
            api_key: api_key.map(|k| Zeroizing::new(k.to_string())),
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let state = AppState::new(config).await;
        let app = routes::create_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown_token();

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
        });

        Self { addr, state, task }
    }

    pub fn http_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Relay URL with the given raw query (without `?`).
    pub fn relay_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("ws://{}/realtime/ws", self.addr)
        } else {
            format!("ws://{}/realtime/ws?{}", self.addr, query)
        }
    }

    pub async fn stop(self) {
        self.state.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}
