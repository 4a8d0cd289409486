mod config;
mod gate;
mod gateway;
mod messaging;
#[cfg(feature = "metrics")]
mod metrics;
mod registry;
mod relay;
mod response;
mod session;
mod telemetry;
mod users;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
#[cfg(feature = "metrics")]
use axum::{http::StatusCode, middleware, response::IntoResponse};
use axum::{
    extract::State,
    http::{
        header::{HeaderName, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post},
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use parley_storage::{
    connect, CreateUserError, NewUser, SessionPersistence, StoragePool, UserRepository,
};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CliOverrides, CorsConfig, DeliveryMode, LogFormat, ServerConfig},
    gate::SessionGate,
    gateway::Gateway,
    messaging::MessageStore,
    registry::ConnectionRegistry,
    relay::Relay,
    session::{
        DatabaseSessionAuthenticator, InMemorySessionStore, PostgresSessionRepository,
        SessionAuthenticator, SessionContext, SessionRepository, SessionSigner,
    },
    telemetry::REQUEST_ID_HEADER,
    users::{DatabaseUserDirectory, UserDirectory},
};

const SECURITY_HEADERS: [(&str, &str); 4] = [
    (
        "content-security-policy",
        "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'",
    ),
    ("referrer-policy", "no-referrer"),
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
];
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug, Default)]
#[command(
    name = "parley-server",
    version,
    about = "Parley direct-messaging backend"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

/// Flags mirroring the config file; any flag given wins over file and environment.
#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    session_signing_key: Option<String>,
    #[arg(long)]
    session_ttl_hours: Option<i64>,
    #[arg(long)]
    session_required: Option<bool>,
    #[arg(long)]
    delivery: Option<DeliveryMode>,
    #[arg(long)]
    max_connections: Option<usize>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
}

impl From<ConfigArgs> for CliOverrides {
    fn from(args: ConfigArgs) -> Self {
        CliOverrides {
            bind_addr: args.bind_addr,
            host: args.host,
            port: args.port,
            log_format: args.log_format,
            database_url: args.database_url,
            session_signing_key: args.session_signing_key,
            session_ttl_hours: args.session_ttl_hours,
            session_required: args.session_required,
            delivery: args.delivery,
            max_connections: args.max_connections,
            metrics_enabled: args.metrics_enabled,
            metrics_bind_addr: args.metrics_bind_addr,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Create an account in the configured database and exit.
    SeedUser(SeedUserCommand),
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    /// Email address; also the identity used on the wire.
    #[arg(long)]
    email: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    number: String,
    #[arg(long)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&cli.config.into())?;

    match cli.command {
        Some(CliCommand::SeedUser(cmd)) => seed_user(&config, cmd).await,
        None => run(Arc::new(config)).await,
    }
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed users"))?;

    let pool = connect(database_url).await?;
    let user = NewUser {
        email: cmd.email,
        username: cmd.username,
        number: cmd.number,
        password: cmd.password,
    };
    match UserRepository::create_user(pool.pool(), &user).await {
        Ok(user_id) => {
            println!("seeded {} ({user_id})", user.email);
            Ok(())
        }
        Err(CreateUserError::Other(err)) => Err(err),
        Err(conflict) => {
            println!("skipped {}: {conflict}", user.email);
            Ok(())
        }
    }
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    telemetry::init_tracing(config.log_format());

    let env_keys = ServerConfig::environment_override_keys();
    if !env_keys.is_empty() {
        info!(keys = ?env_keys, "applied PARLEY_SERVER environment overrides");
    }
    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        database_url_configured = config.database_url.is_some(),
        session_required = config.session.required,
        session_ttl_hours = config.session.ttl_hours,
        delivery = config.gateway.delivery.as_str(),
        max_connections = config.gateway.max_connections,
        outbox_capacity = config.gateway.outbox_capacity,
        cors_allowed_origins = ?config.cors.allowed_origins,
        metrics_enabled = config.metrics.enabled,
        "resolved server configuration"
    );

    let (database, pool) = match config.database_url.as_deref() {
        None => (DatabaseStatus::Unconfigured, None),
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                (DatabaseStatus::Connected, Some(pool))
            }
            Err(err) => {
                error!(?err, "database unavailable; falling back to in-memory stores");
                (DatabaseStatus::Failed(err.to_string()), None)
            }
        },
    };

    let signer = SessionSigner::from_config(&config.session)?;
    info!(
        verifying_key = %signer.verifying_key_base64(),
        ephemeral = config.session.signing_key.is_none(),
        "session signing key ready"
    );

    let authenticator: Arc<dyn SessionAuthenticator>;
    let repository: Arc<dyn SessionRepository>;
    let users: Arc<dyn UserDirectory>;
    match &pool {
        Some(pool) => {
            spawn_session_purge(pool.clone());
            authenticator = Arc::new(DatabaseSessionAuthenticator::new(pool.clone()));
            repository = Arc::new(PostgresSessionRepository::new(pool.clone()));
            users = Arc::new(DatabaseUserDirectory::new(pool.clone()));
        }
        None => {
            let store = Arc::new(InMemorySessionStore::new());
            authenticator = store.clone();
            repository = store.clone();
            users = store;
        }
    }
    let session = Arc::new(
        SessionContext::new(signer, authenticator, repository)
            .with_ttl(chrono::Duration::hours(config.session.ttl_hours)),
    );
    let messages = messaging::init_message_store(pool);

    #[cfg(feature = "metrics")]
    let metrics = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let gateway = init_gateway(&config, session.clone(), messages.clone());
    #[cfg(feature = "metrics")]
    let gateway = gateway.with_metrics(metrics.clone());

    let state = AppState {
        started_at: Instant::now(),
        config: config.clone(),
        database,
        session,
        users,
        messages,
        gateway: Arc::new(gateway),
        #[cfg(feature = "metrics")]
        metrics,
    };

    #[cfg(feature = "metrics")]
    if let (Some(metrics), Some(addr)) = (state.metrics.clone(), &config.metrics.bind_addr) {
        let addr: SocketAddr = addr.parse().context("invalid metrics bind addr")?;
        tokio::spawn(async move {
            if let Err(err) = serve_metrics(addr, metrics).await {
                error!(?err, "metrics listener stopped");
            }
        });
    }

    let addr = config.listener_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_gateway(
    config: &ServerConfig,
    session: Arc<SessionContext>,
    messages: Arc<dyn MessageStore>,
) -> Gateway {
    let registry = Arc::new(ConnectionRegistry::new());
    let gate = SessionGate::new(session, config.session.required);
    let relay = Relay::new(registry, messages, gate, config.gateway.delivery);
    Gateway::new(relay, &config.gateway)
}

fn spawn_session_purge(pool: StoragePool) {
    let persistence = SessionPersistence::new(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match persistence.purge_expired(chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired sessions"),
                Err(err) => warn!(?err, "failed to purge expired sessions"),
            }
        }
    });
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DatabaseStatus {
    Unconfigured,
    Connected,
    Failed(String),
}

impl DatabaseStatus {
    fn is_ready(&self) -> bool {
        matches!(self, DatabaseStatus::Connected)
    }

    fn component(&self) -> ComponentStatus {
        let (status, details) = match self {
            DatabaseStatus::Unconfigured => ("pending", "database_url not configured".to_owned()),
            DatabaseStatus::Connected => ("configured", "connection established".to_owned()),
            DatabaseStatus::Failed(reason) => ("error", reason.clone()),
        };
        ComponentStatus {
            name: "database",
            status,
            details: Some(details),
        }
    }
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    database: DatabaseStatus,
    session: Arc<SessionContext>,
    users: Arc<dyn UserDirectory>,
    messages: Arc<dyn MessageStore>,
    gateway: Arc<Gateway>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn session(&self) -> Arc<SessionContext> {
        self.session.clone()
    }

    fn session_required(&self) -> bool {
        self.config.session.required
    }

    fn users(&self) -> Arc<dyn UserDirectory> {
        self.users.clone()
    }

    fn messages(&self) -> Arc<dyn MessageStore> {
        self.messages.clone()
    }

    fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

async fn health() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let ready = state.database.is_ready();
    #[cfg(feature = "metrics")]
    if let Some(metrics) = &state.metrics {
        metrics.set_db_ready(ready);
    }

    let active = state.gateway.active_connections().await;
    Json(ReadinessResponse {
        status: if ready { "ready" } else { "degraded" },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        components: vec![
            state.database.component(),
            ComponentStatus {
                name: "gateway",
                status: "ready",
                details: Some(format!("{active} active connections")),
            },
        ],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins = config
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| warn!(%origin, "ignoring invalid CORS origin"))
                .ok()
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn build_app(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version))
        .route("/signup", post(users::signup))
        .route("/users", get(users::list_users))
        .route("/login", post(session::login))
        .route("/verify", post(session::verify))
        .route("/messages", post(messaging::history))
        .route("/ws", get(gateway::chat_socket));

    #[cfg(feature = "metrics")]
    if let Some(ctx) = state.metrics.clone() {
        if state.config.metrics.bind_addr.is_none() {
            router = router.route("/metrics", get(metrics_handler));
        }
        router = router.route_layer(middleware::from_fn_with_state(ctx, metrics::track_http));
    }

    let security_headers = SECURITY_HEADERS.map(|(name, value)| {
        SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        )
    });
    let [csp, referrer, nosniff, frame] = security_headers;

    // Outermost first: the id must exist before the trace span and the
    // propagation layer look for it.
    let layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(PropagateHeaderLayer::new(request_id))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(telemetry::http_span)
                .on_response(telemetry::record_response),
        )
        .layer(cors_layer(&state.config.cors))
        .layer(csp)
        .layer(referrer)
        .layer(nosniff)
        .layer(frame);

    router.layer(layers).with_state(state)
}

#[cfg(test)]
static SHUTDOWN_TRIGGER: once_cell::sync::Lazy<tokio::sync::Notify> =
    once_cell::sync::Lazy::new(tokio::sync::Notify::new);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(test)]
    let triggered = SHUTDOWN_TRIGGER.notified();
    #[cfg(not(test))]
    let triggered = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = triggered => {}
    }
    info!("shutdown signal received");
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    match &state.metrics {
        Some(metrics) => render_metrics(metrics),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(feature = "metrics")]
fn render_metrics(metrics: &MetricsContext) -> axum::response::Response {
    match metrics.encode() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
async fn serve_metrics(addr: SocketAddr, metrics: Arc<MetricsContext>) -> Result<()> {
    let router = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { render_metrics(&metrics) }
        }),
    );
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "metrics listening");
    axum::serve(listener, router).await?;
    Ok(())
}
