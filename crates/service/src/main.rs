use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ultradoc_core::parse_upload;
use ultradoc_rag::{
    refine_answer, AskResponse, DocumentSummary, LlmRefiner, Orchestrator, RagConfig, RagError,
    StructuredFields,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<Orchestrator>,
    refiner: Option<Arc<LlmRefiner>>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = RagConfig::discover()?;
    let engine = task::spawn_blocking(move || Orchestrator::open(config)).await??;
    let refiner = LlmRefiner::from_env()?.map(Arc::new);
    if let Some(refiner) = &refiner {
        info!(timeout_ms = refiner.timeout().as_millis() as u64, "answer refinement enabled");
    }
    let state = AppState {
        engine: Arc::new(engine),
        refiner,
    };
    let app = Router::new()
        .route("/", get(health))
        .route("/upload", post(handle_upload))
        .route("/ask", post(handle_ask))
        .route("/extract", post(handle_extract))
        .route("/documents", get(handle_documents))
        .route("/reset", post(handle_reset))
        .with_state(state);
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    documents: usize,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: String,
    document_id: String,
    revision: u32,
    pages: usize,
    chunks: usize,
    structured_fields: StructuredFields,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    question: String,
    /// Defaults to on when a refiner is configured.
    refine: Option<bool>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "API is running",
        documents: state.engine.documents().len(),
    })
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let upload = extract_file(&mut multipart).await?;
    let document_id = document_id_for(upload.filename.as_deref())?;
    let engine = state.engine.clone();
    let report = task::spawn_blocking(move || {
        let pages = parse_upload(&document_id, &upload.data).map_err(RagError::from)?;
        engine.ingest(&document_id, &document_id, pages)
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(UploadResponse {
        message: "File uploaded and processed successfully".to_string(),
        document_id: report.document_id,
        revision: report.revision,
        pages: report.pages,
        chunks: report.chunks,
        structured_fields: report.fields,
    }))
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(body): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let engine = state.engine.clone();
    let question = body.question.clone();
    let grounded = task::spawn_blocking(move || engine.ask(&question))
        .await
        .map_err(AppError::internal)??;

    let refiner = match (&state.refiner, body.refine.unwrap_or(true)) {
        (Some(refiner), true) => refiner.clone(),
        _ => return Ok(Json(grounded)),
    };
    let limit = refiner.timeout() + Duration::from_millis(500);
    let fallback = grounded.clone();
    let question = body.question;
    let refined = task::spawn_blocking(move || refine_answer(refiner.as_ref(), &question, grounded));
    match tokio::time::timeout(limit, refined).await {
        Ok(Ok(response)) => Ok(Json(response)),
        Ok(Err(err)) => {
            warn!(error = %err, "refinement task failed, keeping grounded answer");
            Ok(Json(fallback))
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "refinement timed out, keeping grounded answer");
            Ok(Json(fallback))
        }
    }
}

async fn handle_extract(State(state): State<AppState>) -> Result<Json<StructuredFields>, AppError> {
    let engine = state.engine.clone();
    let fields = task::spawn_blocking(move || engine.extract_all())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(fields))
}

async fn handle_documents(State(state): State<AppState>) -> Json<Vec<DocumentSummary>> {
    Json(state.engine.documents())
}

async fn handle_reset(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let engine = state.engine.clone();
    task::spawn_blocking(move || engine.reset())
        .await
        .map_err(AppError::internal)??;
    Ok(StatusCode::NO_CONTENT)
}

struct UploadedFile {
    data: Vec<u8>,
    filename: Option<String>,
}

async fn extract_file(multipart: &mut Multipart) -> Result<UploadedFile, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(AppError::bad_request)?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().map(|s| s.to_string());
            let data = field.bytes().await.map_err(AppError::bad_request)?;
            return Ok(UploadedFile {
                data: data.to_vec(),
                filename,
            });
        }
    }
    Err(AppError::bad_request("missing file"))
}

// uploads are keyed by their bare file name
fn document_id_for(filename: Option<&str>) -> Result<String, AppError> {
    filename
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("upload needs a file name"))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err)
        } else {
            Self::internal(err)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
