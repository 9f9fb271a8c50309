mod api;
mod audit;
mod auth;
mod clock;
mod config;
mod content;
mod db;
mod dispatch;
mod error;
mod notify;
mod presence;
mod reconcile;
mod registry;
mod telemetry;
mod ws;

#[cfg(test)]
mod testing;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::{Authorizer, TokenAuthorizer};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::content::ContentSync;
use crate::dispatch::{ChannelRegistry, CommandDispatcher};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::presence::PresenceTracker;
use crate::reconcile::Reconciler;
use crate::registry::DeviceRegistry;
use crate::telemetry::TelemetryAggregator;
use crate::ws::WsEvent;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Signage fleet backend: device presence, commands and content sync")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Bind address for the HTTP server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ─── App State ───────────────────────────────────────────────────────────────

/// Implementations of the interfaces the core consumes but does not own
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub authorizer: Arc<dyn Authorizer>,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Config,
    pub event_tx: broadcast::Sender<WsEvent>,
    pub authorizer: Arc<dyn Authorizer>,
    pub registry: Arc<DeviceRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub content: Arc<ContentSync>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub channels: Arc<ChannelRegistry>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    /// Wire the services leaves-first: registry, telemetry, presence, then the
    /// dispatcher and content sync that depend on them.
    pub fn build(pool: SqlitePool, config: Config, collab: Collaborators) -> Arc<Self> {
        let Collaborators {
            clock,
            audit,
            notifier,
            authorizer,
        } = collab;
        let (event_tx, _) = broadcast::channel::<WsEvent>(256);

        let registry = Arc::new(DeviceRegistry::new(
            pool.clone(),
            event_tx.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let telemetry = Arc::new(TelemetryAggregator::new(
            pool.clone(),
            clock.clone(),
            config.telemetry.sample_window,
        ));
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            telemetry.clone(),
            notifier,
            event_tx.clone(),
            clock.clone(),
            config.presence.clone(),
        ));
        let channels = Arc::new(ChannelRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            pool.clone(),
            registry.clone(),
            presence.clone(),
            telemetry.clone(),
            channels.clone(),
            audit.clone(),
            event_tx.clone(),
            clock.clone(),
            config.commands.clone(),
        ));
        let content = Arc::new(ContentSync::new(
            pool.clone(),
            registry.clone(),
            audit,
            event_tx.clone(),
            clock,
            config.content.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            presence.clone(),
            dispatcher.clone(),
            content.clone(),
        ));

        Arc::new(AppState {
            pool,
            config,
            event_tx,
            authorizer,
            registry,
            presence,
            dispatcher,
            content,
            telemetry,
            channels,
            reconciler,
        })
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging
    let default_filter = format!("server={},audit=info,tower_http=info", args.log_level.to_lowercase());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("=== Signage fleet backend v{} starting ===", env!("CARGO_PKG_VERSION"));

    // Configuration
    let mut config = config::load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.server.database_url = url;
    }
    tracing::info!(
        staleness_secs = config.presence.staleness_secs,
        delivery_timeout_secs = config.commands.delivery_timeout_secs,
        max_retries = config.content.max_retries,
        "Configuration loaded"
    );

    // Database
    let pool = db::init_pool(&config.server.database_url).await?;
    tracing::info!("Database ready");

    // Collaborators
    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.clone() {
        Some(url) => {
            tracing::info!("Offline alerts go to webhook {}", url);
            Arc::new(WebhookNotifier::new(url))
        }
        None => Arc::new(LogNotifier),
    };
    if !config.auth.require_token {
        tracing::warn!("Admin API is open: auth.require_token is false");
    }
    let collab = Collaborators {
        clock: Arc::new(SystemClock),
        audit: Arc::new(TracingAuditSink),
        notifier,
        authorizer: Arc::new(TokenAuthorizer::new(&config.auth)),
    };

    let bind = config.server.bind.clone();
    let sweep_period = tokio::time::Duration::from_secs(config.presence.sweep_interval_secs.max(1));
    let state = AppState::build(pool.clone(), config, collab);

    // Reconciliation ticker, stopped with the server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_task = state.reconciler.clone().spawn(sweep_period, shutdown_rx);

    // Build router
    let app = build_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = reconciler_task.await;
    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Device-facing: devices identify themselves by key or id
    let device_routes = Router::new()
        .route("/api/heartbeat", post(api::device_link::heartbeat))
        .route("/api/commands/pending", get(api::device_link::pending_commands))
        .route("/api/commands/:id/ack", post(api::device_link::ack_command))
        .route("/api/content/manifest", get(api::device_link::manifest))
        .route("/api/content/sync-status", post(api::device_link::sync_status))
        .route("/api/devices/:id/channel", get(api::device_channel::channel_handler));

    // Admin-facing: every route passes the authorizer first
    let admin_routes = Router::new()
        // WebSocket event stream
        .route("/ws", get(api::ws_handler::ws_handler))
        // Devices
        .route("/api/devices", get(api::devices::list_devices).post(api::devices::add_device))
        .route(
            "/api/devices/:id",
            get(api::devices::get_device)
                .patch(api::devices::update_device)
                .delete(api::devices::delete_device),
        )
        .route("/api/devices/:id/state", post(api::devices::set_device_state))
        .route(
            "/api/devices/:id/commands",
            get(api::commands::list_commands).post(api::commands::submit_command),
        )
        .route("/api/devices/:id/telemetry", get(api::devices::get_telemetry))
        .route("/api/devices/:id/sync", get(api::content::device_sync))
        // Commands
        .route("/api/commands/:id", get(api::commands::get_command))
        .route("/api/commands/:id/cancel", post(api::commands::cancel_command))
        // Content
        .route("/api/content", get(api::content::list_content).post(api::content::create_content))
        .route("/api/content/:id", get(api::content::get_content))
        .route("/api/content/:id/assign", post(api::content::assign_content))
        .route("/api/content/:id/sync", get(api::content::content_sync))
        .route(
            "/api/content/:id/devices/:device_id/retry",
            post(api::content::retry_sync),
        )
        // Fleet
        .route("/api/fleet/summary", get(api::fleet::summary))
        .route("/api/fleet/outdated", get(api::fleet::outdated))
        .route("/api/fleet/reconcile", post(api::fleet::reconcile))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    Router::new()
        .merge(device_routes)
        .merge(admin_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
