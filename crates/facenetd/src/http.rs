//! HTTP surface: `POST /api/recognize` and `GET /health`.
//!
//! Every outcome of a recognition request, including failures, is rendered as
//! the same JSON body shape.

use crate::engine::EngineHandle;
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use facenet_core::Recognition;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SERVICE_NAME: &str = "facenet-recognition";
const IMAGE_FIELD: &str = "image";

/// Response body of `POST /api/recognize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognizeResponse {
    pub success: bool,
    pub embedding: Vec<f32>,
    pub embedding_size: usize,
    pub message: String,
}

impl RecognizeResponse {
    fn found(embedding: Vec<f32>) -> Self {
        Self {
            success: true,
            embedding_size: embedding.len(),
            embedding,
            message: String::new(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            embedding: Vec::new(),
            embedding_size: 0,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// Request failures, each mapped to a status code and a failure body.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image file provided")]
    MissingImage,
    #[error("No image file selected")]
    EmptyImage,
    #[error("Invalid image file")]
    InvalidImage,
    #[error("Image file too large")]
    TooLarge,
    #[error("Error processing image: {0}")]
    Processing(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::EmptyImage | ApiError::InvalidImage => {
                StatusCode::BAD_REQUEST
            }
            ApiError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(RecognizeResponse::failure(self.to_string()))).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
}

pub fn router(engine: EngineHandle, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/recognize", post(recognize))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState { engine })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        service: SERVICE_NAME.into(),
    })
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!(error = %e, "request is not a multipart upload");
        ApiError::MissingImage
    })?;

    let bytes = read_image_field(&mut multipart).await?;
    tracing::info!(bytes = bytes.len(), "received image");

    let image = decode_image(bytes).await?;

    match state.engine.recognize(image).await {
        Ok(Recognition::Found {
            embedding,
            angles_detected,
        }) => {
            tracing::info!(
                size = embedding.dim(),
                angles_detected,
                "face detected, embedding generated"
            );
            Ok(Json(RecognizeResponse::found(embedding.values)))
        }
        Ok(Recognition::NotFound) => {
            tracing::warn!("no face detected");
            Ok(Json(RecognizeResponse::failure("No face detected")))
        }
        Err(e) => {
            tracing::error!(error = %e, "error processing image");
            Err(ApiError::Processing(e.to_string()))
        }
    }
}

/// Pull the bytes of the `image` file part, skipping any other fields.
///
/// A part without a `filename` parameter is a plain form value, not a file.
async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ApiError::MissingImage),
            Err(e) => return Err(multipart_error(e, "malformed multipart body")),
        };
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(file_name) = field.file_name() else {
            tracing::debug!("ignoring image part without a filename");
            continue;
        };

        let unnamed = file_name.is_empty();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, "failed to read image field"))?;
        if unnamed || bytes.is_empty() {
            return Err(ApiError::EmptyImage);
        }
        return Ok(bytes);
    }
}

fn multipart_error(e: MultipartError, context: &str) -> ApiError {
    tracing::warn!(error = %e, "{context}");
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::TooLarge
    } else {
        ApiError::InvalidImage
    }
}

/// Decode any supported image format to RGB8 off the async runtime.
async fn decode_image(bytes: Bytes) -> Result<RgbImage, ApiError> {
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| ApiError::Processing(e.to_string()))?;

    match decoded {
        Ok(image) => Ok(image.to_rgb8()),
        Err(e) => {
            tracing::debug!(error = %e, "undecodable upload");
            Err(ApiError::InvalidImage)
        }
    }
}
