use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

use anyhow::anyhow;

use duplex_gateway::{
    ServerConfig,
    client::{CallOptions, CallPlan, run_call},
    core::{
        capture::{CommitMode, SpeechDetectorConfig, WavSource},
        turn::{InterruptSource, NoticeLevel},
    },
    routes,
    state::AppState,
};

/// Duplex Gateway - Real-time speech-to-speech relay
#[derive(Parser, Debug)]
#[command(name = "duplex-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve,

    /// Place a call through a running gateway, using WAV files as
    /// microphone and speaker
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Base URL of the gateway
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: Url,

    /// WAV file played as the microphone
    #[arg(short = 'i', long, value_name = "FILE")]
    input: PathBuf,

    /// WAV file receiving the assistant's speech
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    voice: Option<String>,

    /// System instructions for the assistant
    #[arg(long)]
    instructions: Option<String>,

    /// Commit the input buffer from the client instead of server VAD
    #[arg(long)]
    manual_commit: bool,

    /// Let the local speech detector interrupt the assistant
    #[arg(long)]
    local_interrupt: bool,

    /// Transcribe the input with this model
    #[arg(long, value_name = "MODEL")]
    transcribe: Option<String>,

    /// Seconds to wait for the assistant after the input ends
    #[arg(long, default_value_t = 10)]
    linger_secs: u64,

    /// Feed the input as fast as possible instead of in real time
    #[arg(long)]
    no_pace: bool,
}

impl CallArgs {
    fn plan(&self) -> CallPlan {
        let mut options = CallOptions {
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            input_transcription: self.transcribe.clone(),
            ..Default::default()
        };
        if self.manual_commit {
            options.capture.commit_mode = CommitMode::Manual;
        }
        if self.local_interrupt {
            options.capture.speech_detection = Some(SpeechDetectorConfig::default());
            options.interrupt_source = InterruptSource::Local;
        }

        let mut plan = CallPlan::new(self.server.clone());
        plan.model = self.model.clone();
        plan.options = options;
        plan.output = self.output.clone();
        plan.linger = Duration::from_secs(self.linger_secs);
        plan
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
        Commands::Call(args) => call(args).await,
    }
}

async fn call(args: CallArgs) -> anyhow::Result<()> {
    let source = WavSource::open(&args.input, !args.no_pace)
        .map_err(|e| anyhow!("Failed to open input: {}", e))?;
    info!(
        input = %args.input.display(),
        seconds = source.duration().as_secs_f64(),
        "Placing call"
    );

    let hangup = CancellationToken::new();
    let ctrl_c_hangup = hangup.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_hangup.cancel();
        }
    });

    let report = run_call(args.plan(), source, hangup)
        .await
        .map_err(|e| anyhow!("Call failed: {}", e))?;

    for utterance in report.transcript.utterances() {
        println!("[{}] {}", utterance.role, utterance.text);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.notices.iter().any(|n| n.level == NoticeLevel::Error) {
        anyhow::bail!("Call ended with an error in state {}", report.final_state);
    }
    Ok(())
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Load configuration from file or environment
    let config = if let Some(config_path) = config_path {
        println!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    if !config.has_upstream_credential() {
        warn!(
            provider = %config.upstream.provider,
            "No upstream API key configured; relay connections will be closed with 1011"
        );
    }

    let address = config.address();
    let tls_config = config.tls.clone();
    let rate_limit_rps = config.rate_limit_requests_per_second;
    let rate_limit_burst = config.rate_limit_burst_size;
    println!("Starting server on {address}");

    // Create application state
    let app_state = AppState::new(config).await;
    let shutdown = app_state.shutdown_token();

    // Configure rate limiting (disabled when rate >= 100000 for performance testing)
    let governor_layer = if rate_limit_rps < 100000 {
        let governor_config = GovernorConfigBuilder::default()
            .per_second(rate_limit_rps as u64)
            .burst_size(rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("Failed to build rate limiter config"))?;
        Some(GovernorLayer::new(governor_config))
    } else {
        println!("Rate limiting disabled (rate >= 100000/s)");
        None
    };

    // Security headers
    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    let app = routes::create_router(app_state)
        .layer(tower::util::option_layer(governor_layer))
        .layer(security_headers);

    // Parse socket address
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    // Start server with or without TLS
    if let Some(tls) = tls_config {
        // Load TLS configuration from certificate and key files
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to load TLS certificates from {} and {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                )
            })?;

        println!("Server listening on https://{} (TLS enabled)", socket_addr);

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown).await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(socket_addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| anyhow!("TLS server error: {}", e))?;
    } else {
        println!("Server listening on http://{}", socket_addr);

        let listener = TcpListener::bind(&socket_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    }

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl+C and cancels every relay session still running.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, closing relay sessions");
    shutdown.cancel();
}
