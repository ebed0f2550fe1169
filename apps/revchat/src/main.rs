use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod settings;

use revchat_core::{Core, ProviderLookup};
use revchat_provider_core::{CredentialPool, Provider};
use revchat_provider_impl::provider::you::YouProvider;
use revchat_provider_impl::provider::{GrokProvider, XaiProvider};
use revchat_provider_impl::{BackendKind, GatewayContext, OrchestratorConfig, TransportSlot};
use revchat_store::FileArtifactStore;

use crate::cli::Cli;
use crate::settings::Settings;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();
    if let Err(err) = run().await {
        eprintln!("revchat failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(proxy) = cli.proxy {
        settings.proxy = Some(proxy);
    }
    if let Some(state_dir) = cli.state_dir {
        settings.state_dir = state_dir;
    }
    for section in settings.placeholder_secrets() {
        warn!(section, "config still contains placeholder secrets");
    }

    let store = FileArtifactStore::open(&settings.state_dir)?;
    let transport = Arc::new(TransportSlot::new(settings.proxy.clone())?);
    let orchestrator = OrchestratorConfig {
        attempt_budget: settings.attempt_budget,
        ..OrchestratorConfig::default()
    };

    let mut context = GatewayContext::new();

    if settings.you_cookies.is_empty() {
        warn!(backend = "you", "no credentials configured, backend disabled");
    } else {
        let kind = BackendKind::You;
        let snapshot = store.load_pool(kind.name(), settings.you_secrets());
        let credentials = snapshot.credentials.len();
        let pool = CredentialPool::new(
            kind.name(),
            settings.rotation.you.pool_config(),
            snapshot,
            store.sink(kind.name()),
        );
        let provider = YouProvider::new(
            pool,
            transport.clone(),
            settings.you_settings.clone(),
            settings.rotation.you.mode_config(),
            orchestrator,
        );
        context.register(kind, Arc::new(provider));
        info!(backend = kind.name(), credentials, "backend configured");
    }

    if settings.x_credentials.is_empty() {
        warn!(backend = "xai", "no credentials configured, backend disabled");
    } else {
        let kind = BackendKind::Xai;
        let snapshot = store.load_pool(kind.name(), settings.x_secrets());
        let credentials = snapshot.credentials.len();
        let pool = CredentialPool::new(
            kind.name(),
            settings.rotation.x.pool_config(),
            snapshot,
            store.sink(kind.name()),
        );
        let provider = XaiProvider::new(pool, transport.clone(), orchestrator);
        context.register(kind, Arc::new(provider));
        info!(backend = kind.name(), credentials, "backend configured");
    }

    if settings.grok_cookies.is_empty() {
        warn!(backend = "grok", "no credentials configured, backend disabled");
    } else {
        let kind = BackendKind::Grok;
        let snapshot = store.load_pool(kind.name(), settings.grok_secrets());
        let credentials = snapshot.credentials.len();
        let pool = CredentialPool::new(
            kind.name(),
            settings.rotation.grok.pool_config(),
            snapshot,
            store.sink(kind.name()),
        );
        let provider = GrokProvider::new(pool, transport.clone(), orchestrator);
        context.register(kind, Arc::new(provider));
        info!(backend = kind.name(), credentials, "backend configured");
    }

    if context.is_empty() {
        warn!("no backends configured; every request will fail until credentials are added");
    }

    let providers: Vec<Arc<dyn Provider>> = context.providers().cloned().collect();
    let context = Arc::new(context);
    let lookup: ProviderLookup = {
        let context = context.clone();
        Arc::new(move |model| context.provider_for_model(model))
    };

    let core = Core::new(lookup, providers);
    let app = core
        .router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let bind = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "revchat.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("revchat=info,tower_http=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr.and(file_writer))
        .init();
    guard
}
