//! Request outcome taxonomy and its mapping onto HTTP responses

use crate::file_validator::ValidationError;
use crate::output_spec::OutputSpecError;
use crate::quality_gate::QualityVerdict;
use crate::rate_limiter::{RateLimitExceeded, RateLimitScope};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::{error, info};

const GENERIC_FAILURE: &str = "An unexpected error occurred while processing the photo. Please try again later.";

#[derive(Debug)]
pub enum PreviewError {
    TooLarge { size: usize, limit: usize },
    UnsupportedMediaType(String),
    InvalidImage(String),
    FormatMismatch { declared: String, detected: String },
    InvalidParameter(String),
    MissingFile,
    NoFace,
    MultipleFaces,
    FaceTooSmall,
    FaceTooCloseToEdge,
    RateLimitExceeded(RateLimitExceeded),
    UpstreamFailure(String),
    UpstreamTimeout { service: &'static str, after: Duration },
    InternalError(String),
}

impl PreviewError {
    /// Error for a rejecting verdict, `None` for `Accepted`
    pub fn from_verdict(verdict: QualityVerdict) -> Option<Self> {
        match verdict {
            QualityVerdict::Accepted => None,
            QualityVerdict::NoFace => Some(PreviewError::NoFace),
            QualityVerdict::MultipleFaces => Some(PreviewError::MultipleFaces),
            QualityVerdict::FaceTooSmall => Some(PreviewError::FaceTooSmall),
            QualityVerdict::FaceTooCloseToEdge => Some(PreviewError::FaceTooCloseToEdge),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PreviewError::TooLarge { .. } => "too_large",
            PreviewError::UnsupportedMediaType(_) => "unsupported_media_type",
            PreviewError::InvalidImage(_) => "invalid_image",
            PreviewError::FormatMismatch { .. } => "format_mismatch",
            PreviewError::InvalidParameter(_) => "invalid_parameter",
            PreviewError::MissingFile => "missing_file",
            PreviewError::NoFace => "no_face",
            PreviewError::MultipleFaces => "multiple_faces",
            PreviewError::FaceTooSmall => "face_too_small",
            PreviewError::FaceTooCloseToEdge => "face_too_close_to_edge",
            PreviewError::RateLimitExceeded(_) => "rate_limit_exceeded",
            PreviewError::UpstreamFailure(_) => "upstream_failure",
            PreviewError::UpstreamTimeout { .. } => "upstream_timeout",
            PreviewError::InternalError(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PreviewError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PreviewError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PreviewError::InvalidImage(_)
            | PreviewError::FormatMismatch { .. }
            | PreviewError::InvalidParameter(_)
            | PreviewError::MissingFile
            | PreviewError::NoFace
            | PreviewError::MultipleFaces
            | PreviewError::FaceTooSmall
            | PreviewError::FaceTooCloseToEdge => StatusCode::BAD_REQUEST,
            PreviewError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            PreviewError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PreviewError::UpstreamFailure(_) | PreviewError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing message. Server-side failures never expose their detail.
    pub fn detail(&self) -> String {
        match self {
            PreviewError::TooLarge { limit, .. } => format!(
                "File size is too large. Maximum allowed size is {}.",
                format_size(*limit)
            ),
            PreviewError::UnsupportedMediaType(declared) => format!(
                "Unsupported file type '{declared}'. Please upload a JPEG or PNG image."
            ),
            PreviewError::InvalidImage(_) => {
                "Invalid image file. Please upload a valid image.".to_string()
            }
            PreviewError::FormatMismatch { declared, detected } => format!(
                "File content does not match its declared type (declared {declared}, found {detected}). Please upload a valid image."
            ),
            PreviewError::InvalidParameter(msg) => msg.clone(),
            PreviewError::MissingFile => {
                "No file uploaded. Please attach a photo in the 'file' field.".to_string()
            }
            PreviewError::NoFace => {
                "No face detected. Please ensure your face is clearly visible in the photo."
                    .to_string()
            }
            PreviewError::MultipleFaces => {
                "Multiple faces detected. Please use a photo with only one person.".to_string()
            }
            PreviewError::FaceTooSmall => {
                "Your face is too small in the photo. Please take the photo closer to the camera."
                    .to_string()
            }
            PreviewError::FaceTooCloseToEdge => {
                "Your face is too close to the edge of the photo. Please center your face in the frame."
                    .to_string()
            }
            PreviewError::RateLimitExceeded(exceeded) => match exceeded.scope {
                RateLimitScope::Hourly => format!(
                    "Hourly photo processing limit reached ({} photos/hour). Please try again within 1 hour.",
                    exceeded.limit
                ),
                RateLimitScope::Daily => format!(
                    "Daily photo processing limit reached ({} photos/day). Please try again within 24 hours.",
                    exceeded.limit
                ),
            },
            PreviewError::UpstreamTimeout { .. } => {
                "Photo processing took too long. Please try again later.".to_string()
            }
            PreviewError::UpstreamFailure(_) | PreviewError::InternalError(_) => {
                GENERIC_FAILURE.to_string()
            }
        }
    }
}

impl fmt::Display for PreviewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviewError::TooLarge { size, limit } => {
                write!(f, "Upload too large: {size} bytes (limit {limit})")
            }
            PreviewError::UnsupportedMediaType(declared) => {
                write!(f, "Unsupported media type: {declared}")
            }
            PreviewError::InvalidImage(msg) => write!(f, "Invalid image: {msg}"),
            PreviewError::FormatMismatch { declared, detected } => {
                write!(f, "Format mismatch: declared {declared}, detected {detected}")
            }
            PreviewError::InvalidParameter(msg) => write!(f, "Invalid parameter: {msg}"),
            PreviewError::MissingFile => write!(f, "No file field in upload"),
            PreviewError::NoFace
            | PreviewError::MultipleFaces
            | PreviewError::FaceTooSmall
            | PreviewError::FaceTooCloseToEdge => write!(f, "Quality gate rejected: {}", self.kind()),
            PreviewError::RateLimitExceeded(exceeded) => write!(f, "Rate limited: {exceeded}"),
            PreviewError::UpstreamFailure(msg) => write!(f, "Upstream failure: {msg}"),
            PreviewError::UpstreamTimeout { service, after } => {
                write!(f, "{service} timed out after {after:?}")
            }
            PreviewError::InternalError(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl Error for PreviewError {}

impl From<ValidationError> for PreviewError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::TooLarge { size, limit } => PreviewError::TooLarge { size, limit },
            ValidationError::UnsupportedMediaType(declared) => {
                PreviewError::UnsupportedMediaType(declared)
            }
            ValidationError::InvalidImage(msg) => PreviewError::InvalidImage(msg),
            ValidationError::FormatMismatch { declared, detected } => PreviewError::FormatMismatch {
                declared: declared.mime_type().to_string(),
                detected: detected.mime_type().to_string(),
            },
        }
    }
}

impl From<OutputSpecError> for PreviewError {
    fn from(err: OutputSpecError) -> Self {
        PreviewError::InvalidParameter(err.to_string())
    }
}

impl From<RateLimitExceeded> for PreviewError {
    fn from(err: RateLimitExceeded) -> Self {
        PreviewError::RateLimitExceeded(err)
    }
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Preview request failed ({}): {}", self.kind(), self);
        } else {
            info!("Preview request rejected ({}): {}", self.kind(), self);
        }

        let detail = self.detail();
        match self {
            PreviewError::RateLimitExceeded(exceeded) => {
                let retry_after_seconds = exceeded.retry_after.as_secs().max(1);
                let body = json!({
                    "detail": detail,
                    "scope": exceeded.scope.as_str(),
                    "limit": exceeded.limit,
                    "retry_after_seconds": retry_after_seconds,
                });
                let mut response = (status, Json(body)).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_seconds),
                );
                response
            }
            _ => (status, Json(json!({ "detail": detail }))).into_response(),
        }
    }
}

/// Human readable byte count, whole MB when it divides evenly
pub fn format_size(bytes: usize) -> String {
    const MB: usize = 1024 * 1024;
    const KB: usize = 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{} KB", bytes / KB)
    } else {
        format!("{bytes} bytes")
    }
}
