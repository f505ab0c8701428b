use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;

use wsp_domain::config::{Config, ObservabilityConfig};
use wsp_domain::hostname::replica_hostname;
use wsp_gateway::api;
use wsp_gateway::bootstrap;
use wsp_gateway::cli::{Cli, Command, ConfigCommand};
use wsp_gateway::{NodeError, ProxyNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let (config, _config_path) = wsp_gateway::cli::load_config()?;
            let tracer_provider = init_tracing(&config.observability);
            let outcome = run_server(Arc::new(config)).await;
            shutdown_tracing(tracer_provider);
            match outcome? {
                None => Ok(()),
                Some(fatal) => {
                    eprintln!("wsproxy: {fatal}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Doctor) => {
            init_cli_tracing();
            let (config, config_path) = wsp_gateway::cli::load_config()?;
            let passed = wsp_gateway::cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = wsp_gateway::cli::load_config()?;
            let valid = wsp_gateway::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = wsp_gateway::cli::load_config()?;
            print!("{}", wsp_gateway::cli::config::show(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            let build = wsp_domain::buildinfo::BuildInfo::current();
            if build.external_url.is_empty() {
                println!("wsproxy {}", build.version);
            } else {
                println!("wsproxy {} ({})", build.version, build.external_url);
            }
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
///
/// When `otlp_endpoint` is configured, an OpenTelemetry layer is added
/// so that every `tracing` span is also exported as an OTel span via
/// OTLP/gRPC.  The returned [`SdkTracerProvider`] handle must be shut
/// down on exit to flush pending spans.
///
/// [`SdkTracerProvider`]: opentelemetry_sdk::trace::SdkTracerProvider
fn init_tracing(obs: &ObservabilityConfig) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wsp_gateway=debug,wsp_sdk=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let Some(endpoint) = obs.export_endpoint() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!(
                "WARNING: failed to create OTLP exporter for {endpoint}: {e}; \
                 starting without OpenTelemetry"
            );
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let replica = obs
        .replica_attributes(&replica_hostname())
        .into_iter()
        .map(|(key, value)| KeyValue::new(key, value));
    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name().to_owned())
        .with_attributes(replica)
        .build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            obs.sample_rate,
        ))
        .with_resource(resource)
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(obs.service_name().to_owned()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(tracer_provider)
}

/// Flush and shut down the OTel tracer provider so pending spans are
/// exported before the process exits.
fn shutdown_tracing(provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = ?e, "OpenTelemetry tracer provider shutdown failed");
        }
    }
}

/// Initialize compact stderr-only tracing for CLI one-shot commands.
///
/// Defaults to `warn` level so diagnostic output does not pollute stdout.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Run the proxy until a signal or the node's fatal signal.  Returns the
/// fatal error, if that is what stopped it.
async fn run_server(config: Arc<Config>) -> anyhow::Result<Option<NodeError>> {
    tracing::info!(version = %wsp_domain::buildinfo::version(), "wsproxy starting");

    // ── Node ─────────────────────────────────────────────────────────
    let state = bootstrap::build_app_state(config.clone()).await?;
    let node = state.node.clone();

    // ── CORS layer (dashboard origin) ────────────────────────────────
    let cors_layer = build_cors_layer(&config, &node);

    // ── Concurrency limit (backpressure protection) ────────────────
    let max_concurrent = config.server.max_concurrent_requests;
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Rate-limit layer (per-IP token bucket via governor) ─────────
    let governor_layer = match config.server.rate_limit.as_ref() {
        Some(rl) => {
            use tower_governor::governor::GovernorConfigBuilder;
            use tower_governor::GovernorLayer;

            let gov_config = GovernorConfigBuilder::default()
                .per_second(rl.requests_per_second)
                .burst_size(rl.burst_size)
                .finish()
                .context("rate_limit: requests_per_second and burst_size must be > 0")?;

            tracing::info!(
                requests_per_second = rl.requests_per_second,
                burst_size = rl.burst_size,
                "per-IP rate limiting enabled"
            );
            Some(GovernorLayer {
                config: Arc::new(gov_config),
            })
        }
        None => {
            tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
            None
        }
    };

    // ── Router ───────────────────────────────────────────────────────
    let router = api::router(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = match governor_layer {
        Some(gov) => router.layer(gov).with_state(state),
        None => router.with_state(state),
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            let _ = node.close().await;
            return Err(e).with_context(|| format!("binding to {addr}"));
        }
    };

    tracing::info!(addr = %addr, replica_id = %node.replica_id(), "wsproxy listening");

    let fatal = Arc::new(parking_lot::Mutex::new(None));
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(node.clone(), fatal.clone()))
    .await
    .context("axum server error");

    // ── Node shutdown ───────────────────────────────────────────────
    tracing::info!("server stopped, closing proxy node");
    if let Err(e) = node.close().await {
        tracing::warn!(error = %e, "proxy node shutdown incomplete");
    }
    served?;

    tracing::info!("shutdown complete");
    let fatal = fatal.lock().take();
    Ok(fatal)
}

/// Wait for SIGINT, SIGTERM, or the node declaring itself unusable, then
/// return to trigger graceful shutdown of the Axum server.
async fn shutdown_signal(node: ProxyNode, fatal: Arc<parking_lot::Mutex<Option<NodeError>>>) {
    let ctrl_c = tokio::signal::ctrl_c();
    let node_fatal = node.fatal();

    #[cfg(unix)]
    {
        let mut sigterm_stream =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    None
                }
            };
        let sigterm = async {
            match sigterm_stream.as_mut() {
                Some(s) => {
                    s.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm => tracing::info!("received SIGTERM, shutting down"),
            err = node_fatal => {
                tracing::error!(error = %err, "proxy node is unusable, shutting down");
                *fatal.lock() = Some(err);
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            err = node_fatal => {
                tracing::error!(error = %err, "proxy node is unusable, shutting down");
                *fatal.lock() = Some(err);
            }
        }
    }
}

/// Build a [`CorsLayer`] allowing the dashboard origin, or every origin
/// when `server.cors.allow_all` is set.  The dashboard runs latency checks
/// against the proxy from the browser.
fn build_cors_layer(config: &Config, node: &ProxyNode) -> CorsLayer {
    use axum::http::header;

    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if config.server.cors.allow_all {
        tracing::warn!("CORS allows all origins");
        return base.allow_origin(tower_http::cors::Any);
    }

    let origin = node.dashboard_url().origin().ascii_serialization();
    match origin.parse::<HeaderValue>() {
        Ok(hv) => base.allow_origin(AllowOrigin::exact(hv)),
        Err(_) => {
            tracing::warn!(origin = %origin, "invalid dashboard origin, CORS disabled");
            base
        }
    }
}
