//! HTTP front end.
//!
//! `POST /process` takes a multipart form with `pcd`, `image`, `calibration`
//! and `labels` file fields and answers with the pipeline's JSON result.
//! `GET /health` answers `{"status": "ok"}`.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use tower_http::cors::CorsLayer;

use crate::pipeline::{ErrorKind, InputsBuilder, Pipeline, PipelineError, PipelineInputs, Upload};

/// Build the service router around a shared pipeline.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let body_limit = pipeline.config().server.max_upload_bytes;
    Router::new()
        .route("/process", post(process))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(pipeline: Arc<Pipeline>, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!("could not install Ctrl-C handler: {}", e),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn process(
    State(pipeline): State<Arc<Pipeline>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let result = match read_inputs(multipart).await {
        Ok(inputs) => pipeline.run(inputs).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(output) => (StatusCode::OK, Json(output.to_json())).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn read_inputs(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<PipelineInputs, PipelineError> {
    let mut multipart = multipart.map_err(|e| PipelineError::Upload(e.body_text()))?;
    let mut builder = InputsBuilder::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Upload(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PipelineError::Upload(format!("{}: {}", name, e.body_text())))?;

        if !builder.insert(&name, Upload::new(file_name, bytes.to_vec()))? {
            warn!("ignoring unexpected form field '{}'", name);
        }
    }

    builder.build()
}

fn error_response(e: &PipelineError) -> Response {
    let kind = e.kind();
    match kind {
        ErrorKind::Processing => error!("request failed in {}: {}", e.stage(), e),
        _ => warn!("request rejected ({}) in {}: {}", kind.as_str(), e.stage(), e),
    }
    let status = StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(e.to_json())).into_response()
}
