use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prism_clients::{ClassifierClient, VisionClient};
use prism_core::blob::{self, BlobStore};
use prism_core::config::{Config, Settings};
use prism_core::dedup::InputCache;
use prism_core::error::AnalysisError;
use prism_core::ledger::{generate_request_id, RecordInput, RequestLedger, RequestRecord};
use prism_core::pipeline::{Pipeline, Submission};
use prism_core::queue::DispatchQueue;
use prism_core::sentiment::SentimentScorer;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint - returns 200 OK when the service is running
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    cache: Arc<InputCache>,
    ledger: RequestLedger,
    pipeline: Arc<Pipeline>,
    blob: BlobStore,
    redis: redis::aio::MultiplexedConnection,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// Map a pipeline failure to its client-visible response. Error bodies
/// carry a human-readable message but no internal detail.
fn error_response(err: &AnalysisError) -> Response {
    let status = match err {
        AnalysisError::Unauthorized => StatusCode::UNAUTHORIZED,
        AnalysisError::NotFound => StatusCode::NOT_FOUND,
        AnalysisError::FetchFailed(_)
        | AnalysisError::PersistFailed(_)
        | AnalysisError::ModelUnavailable(_)
        | AnalysisError::EmptyModelOutput
        | AnalysisError::ScoringFailed(_) => StatusCode::BAD_GATEWAY,
    };

    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "internal error".to_string(),
            kind: "internal",
        }),
    )
        .into_response()
}

/// Extract the caller-supplied bearer credential.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// The submission body is a single URL string. Accept both the raw
/// text and a JSON-quoted string.
fn parse_submission_body(body: &str) -> Option<String> {
    let text = match serde_json::from_str::<String>(body) {
        Ok(unquoted) => unquoted,
        Err(_) => body.to_string(),
    };

    let text = text.trim().to_string();
    (text.starts_with("http://") || text.starts_with("https://")).then_some(text)
}

/// A terminal record as returned to clients, with its identifier.
#[derive(Serialize)]
struct RecordResponse {
    id: String,
    #[serde(flatten)]
    record: RequestRecord,
}

#[derive(Deserialize)]
struct AnalyzeQuery {
    /// Optional per-request threshold modifier (divided by 10 and added
    /// to the configured base threshold).
    modifier: Option<i64>,
}

async fn submit_analysis(
    State(state): State<AppState>,
    Query(query): Query<AnalyzeQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // A missing credential fails before any side effect - no ledger
    // record, no fetch.
    let Some(token) = bearer_token(&headers) else {
        warn!("Rejected unauthenticated submission from {}", addr.ip());
        return error_response(&AnalysisError::Unauthorized);
    };

    let Some(source_url) = parse_submission_body(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "request body must be a single image URL".to_string(),
                kind: "bad_request",
            }),
        )
            .into_response();
    };

    let api_key = state.config.resolve_api_key(&token);
    let mut redis = state.redis.clone();
    let settings = Settings::load(&mut redis).await;

    let request_id = generate_request_id(settings.id_length);

    // Resolution failures degrade to the raw source URL; the request
    // still runs, it just records no caching benefit.
    let resolved_url = match state.cache.resolve(&source_url).await {
        Ok(url) => url,
        Err(e) => {
            warn!(
                "Input resolution failed for request {} from {} ({}); using source URL directly",
                request_id,
                addr.ip(),
                e
            );
            source_url.clone()
        }
    };
    let original_url = (resolved_url != source_url).then(|| source_url.clone());

    let input = RecordInput {
        resolved_url: resolved_url.clone(),
        original_url: original_url.clone(),
        threshold: settings.threshold,
        threshold_modifier: query.modifier,
    };
    let pending = RequestRecord::pending(input, addr.ip().to_string());

    if let Err(e) = state.ledger.create(&request_id, &pending).await {
        error!("Failed to create ledger record {}: {}", request_id, e);
        return internal_error();
    }

    info!(
        "Request {} accepted from {} for {}",
        request_id,
        addr.ip(),
        source_url
    );

    let submission = Submission {
        request_id: request_id.clone(),
        resolved_url,
        original_url,
        threshold_modifier: query.modifier,
        requestor_ip: addr.ip().to_string(),
        created_at: pending.created_at,
    };

    match state.pipeline.analyze(submission, &api_key, &settings).await {
        Ok(record) => Json(RecordResponse {
            id: request_id,
            record,
        })
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn poll_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.trim().is_empty() {
        return error_response(&AnalysisError::NotFound);
    }

    match state.ledger.read(&id).await {
        Ok(Some(record)) if record.is_terminal() => {
            Json(RecordResponse { id, record }).into_response()
        }
        Ok(Some(_)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id, "status": "pending" })),
        )
            .into_response(),
        Ok(None) => error_response(&AnalysisError::NotFound),
        Err(e) => {
            error!("Failed to read ledger record {}: {}", id, e);
            internal_error()
        }
    }
}

/// Serve a stored image so canonical URLs under our storage domain
/// resolve back to the persisted bytes.
async fn serve_image(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.contains("..") || id.contains('/') {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.blob.get(&id).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, blob::content_type_for(&id))], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Cross-origin access is restricted to the configured allow-list.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        warn!("⚠️  No ALLOWED_ORIGINS configured - browsers will be refused CORS access");
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid allowed origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "prism=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🔆 Prism starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Configuration loaded");
    info!("  Vision API: {}", config.vision_api_url);
    info!("  Classifier API: {}", config.classifier_api_url);
    info!("  Storage domain: {}", config.public_base_url);

    // Run database migrations first
    {
        use diesel::prelude::*;
        use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
        pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

        let mut conn = diesel::PgConnection::establish(&config.database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
        info!("Database migrations applied");
    }

    if config.shared_access_tokens.is_empty() {
        warn!("No SHARED_ACCESS_TOKENS configured - every caller must supply its own API key");
    }

    // Connect the stores
    let pg = {
        use diesel::prelude::*;
        Arc::new(Mutex::new(diesel::PgConnection::establish(
            &config.database_url,
        )?))
    };
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis = redis_client.get_multiplexed_async_connection().await?;
    info!("Stores connected");

    let blob = BlobStore::new(&config.storage_dir);
    let cache = Arc::new(InputCache::new(
        pg,
        blob.clone(),
        config.public_base_url.clone(),
    )?);
    let ledger = RequestLedger::new(redis.clone());
    let queue = DispatchQueue::new(redis.clone());

    let vision = VisionClient::new(config.vision_api_url.clone())?;
    let classifier = ClassifierClient::new(config.classifier_api_url.clone())?;
    let scorer = SentimentScorer::new(classifier, config.classifier_api_key.clone());
    let pipeline = Arc::new(Pipeline::new(vision, scorer, ledger.clone(), queue));

    let cors = cors_layer(&config.allowed_origins);
    let http_port = config.http_port;

    let state = AppState {
        config: Arc::new(config),
        cache,
        ledger,
        pipeline,
        blob,
        redis,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/analyze", post(submit_analysis))
        .route("/requests/{id}", get(poll_request))
        .route("/images/{id}", get(serve_image))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port)).await?;
    info!("🔆 Prism listening on port {}", http_port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("🔆 Prism has shut down.");

    Ok(())
}
