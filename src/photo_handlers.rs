use crate::error::PreviewError;
use crate::orchestrator::{OutputQuery, PreviewOutput, RequestOrchestrator, UploadedFile};
use crate::output_spec::preset_table;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, ConnectInfo, DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info_span, Instrument};

const FILE_FIELD: &str = "file";
/// Room for multipart framing on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
}

/// Build the service router: `/`, `/health` and the `/api/v1` photo endpoints
pub fn router(orchestrator: Arc<RequestOrchestrator>) -> Router {
    let max_file_size = orchestrator.validator().max_file_size();
    // Oversized uploads are drained up to twice the limit so the client still gets a clean 413
    let body_limit = max_file_size
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/photos/preview", post(preview_handler))
        .route("/photos/formats", get(formats_handler))
        .layer(DefaultBodyLimit::max(body_limit));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", api)
        .layer(cors)
        .with_state(AppState { orchestrator })
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "message": "PhotoID AI API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn formats_handler() -> impl IntoResponse {
    Json(preset_table())
}

pub async fn preview_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    query: Result<Query<OutputQuery>, QueryRejection>,
    multipart: Multipart,
) -> Response {
    let client_id = addr.ip().to_string();
    let request_id = format!("{:016x}", rand::random::<u64>());
    let span = info_span!("preview", client = %client_id, request_id = %request_id);

    async move {
        match handle_preview(&state, &client_id, query, multipart).await {
            Ok(output) => stream_output(output),
            Err(e) => e.into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn handle_preview(
    state: &AppState,
    client_id: &str,
    query: Result<Query<OutputQuery>, QueryRejection>,
    multipart: Multipart,
) -> Result<PreviewOutput, PreviewError> {
    let orchestrator = &state.orchestrator;
    orchestrator.admit(client_id)?;

    let Query(query) = query.map_err(|e| PreviewError::InvalidParameter(e.body_text()))?;
    let upload = read_upload(multipart, orchestrator.validator().max_file_size()).await?;
    debug!(
        "Received upload '{}' ({}, {} bytes)",
        upload.filename,
        upload.content_type,
        upload.bytes.len()
    );

    orchestrator.process_admitted(upload, &query).await
}

/// Read the `file` field, stopping to keep at most `max_file_size + 1` bytes
async fn read_upload(
    mut multipart: Multipart,
    max_file_size: usize,
) -> Result<UploadedFile, PreviewError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        // One byte past the limit is enough to tell an oversized upload apart
        let keep = max_file_size.saturating_add(1);
        let mut buffer = BytesMut::new();
        let mut total = 0usize;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                    return Err(PreviewError::TooLarge {
                        size: total,
                        limit: max_file_size,
                    });
                }
                Err(e) => return Err(multipart_error(e)),
            };
            total = total.saturating_add(chunk.len());
            append_capped(&mut buffer, &chunk, keep);
        }

        if total > max_file_size {
            return Err(PreviewError::TooLarge {
                size: total,
                limit: max_file_size,
            });
        }

        return Ok(UploadedFile {
            bytes: buffer.freeze(),
            content_type,
            filename,
        });
    }

    Err(PreviewError::MissingFile)
}

/// Append as much of `chunk` as fits while keeping `buffer` at most `keep` bytes
fn append_capped(buffer: &mut BytesMut, chunk: &[u8], keep: usize) {
    let room = keep.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> PreviewError {
    PreviewError::InvalidParameter(format!("Malformed multipart body: {}", e.body_text()))
}

/// Stream the rendered file; its cleanup guard lives inside the stream state so
/// the file is removed after the last chunk or when the client goes away.
fn stream_output(output: PreviewOutput) -> Response {
    let PreviewOutput {
        spec,
        file,
        content_length,
        cleanup,
    } = output;

    let stream = futures::stream::unfold(
        (ReaderStream::new(file), cleanup),
        |(mut reader, cleanup)| async move {
            let chunk: std::io::Result<Bytes> = reader.next().await?;
            Some((chunk, (reader, cleanup)))
        },
    );

    let disposition = format!("attachment; filename=\"photo_{}.png\"", spec.format);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(stream));

    match response {
        Ok(response) => response,
        Err(e) => PreviewError::InternalError(format!("failed to build response: {e}"))
            .into_response(),
    }
}
