use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{RetryPolicy, TransferBatch};
use crate::config::Config;
use crate::error::SdkError;
use crate::executor::ModuleExecutor;
use crate::module::Module;
use crate::orchestrator::Orchestrator;
use crate::schema::{
    ConfigQuery, ErrorBody, EvaluateRequest, EvaluateResponse, GenerateRequest, GenerateResponse,
    HealthResponse, InitializeRequest, InitializeResponse,
};
use crate::scratch::ScratchSpace;
use crate::settings::Settings;
use crate::transfer::HttpTransport;

struct AppState {
    orchestrator: Orchestrator,
    started_at: DateTime<Utc>,
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let state = AppState {
        orchestrator,
        started_at: Utc::now(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/initialize", post(initialize))
        .route("/evaluate", post(evaluate))
        .route("/generate", post(generate))
        .with_state(Arc::new(state))
}

pub fn build_orchestrator(
    module: Arc<dyn Module>,
    settings: &Settings,
) -> Result<Orchestrator, SdkError> {
    let configs_dir = settings.configs_dir();
    if !configs_dir.is_dir() {
        return Err(SdkError::ConfigsDirMissing(configs_dir));
    }
    let transport = HttpTransport::new(settings.http_timeout(), settings.chunk_size)?;
    let transfers = TransferBatch::new(
        Arc::new(transport),
        settings.transfer_concurrency,
        RetryPolicy::linear(settings.transfer_retries),
    );
    let executor = ModuleExecutor::new(settings.module_workers(), settings.module_grace());
    let scratch = ScratchSpace::new(settings.scratch_base());
    Ok(
        Orchestrator::new(module, configs_dir, scratch, transfers, executor)
            .with_request_timeout(settings.request_timeout()),
    )
}

pub async fn serve(module: Arc<dyn Module>, settings: &Settings) -> Result<(), SdkError> {
    let orchestrator = build_orchestrator(module, settings)?;
    let listener = TcpListener::bind(settings.bind)
        .await
        .map_err(|err| SdkError::Bind {
            addr: settings.bind.to_string(),
            message: err.to_string(),
        })?;
    info!(
        addr = %settings.bind,
        module = orchestrator.module_name(),
        configs = %orchestrator.configs_dir(),
        "listening"
    );

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| SdkError::Server(err.to_string()))?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        module_name: state.orchestrator.module_name().to_string(),
        status: "running".to_string(),
        started_at: state.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

async fn config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> Result<Json<Config>, SdkError> {
    state.orchestrator.load_config(&query.config_name).await.map(Json)
}

// Each handler owns its request's token; dropping the handler cancels in-flight work.

async fn initialize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InitializeRequest>,
) -> Result<Json<InitializeResponse>, SdkError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let result = state.orchestrator.initialize(request, cancel).await;
    guard.disarm();
    result.map(Json)
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, SdkError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let result = state.orchestrator.evaluate(request, cancel).await;
    guard.disarm();
    result.map(Json)
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, SdkError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let result = state.orchestrator.generate(request, cancel).await;
    guard.disarm();
    result.map(Json)
}

pub fn status_for(err: &SdkError) -> StatusCode {
    match err {
        SdkError::InvalidIndividualId(_)
        | SdkError::DuplicateIndividual { .. }
        | SdkError::InvalidConfigName(_)
        | SdkError::RootKeyMismatch { .. }
        | SdkError::ConfigParse(_)
        | SdkError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        SdkError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
        SdkError::InputUnavailable { .. } => StatusCode::BAD_GATEWAY,
        SdkError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for SdkError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = ErrorBody {
            kind: self.kind().to_string(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
