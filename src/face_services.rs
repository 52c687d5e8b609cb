//! External model collaborators: face detection and background removal

use crate::quality_gate::Detection;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbaImage};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub enum UpstreamError {
    /// The collaborator could not read the image it was given
    ImageRead(String),
    Request(String),
    InvalidResponse(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::ImageRead(msg) => write!(f, "Image read error: {msg}"),
            UpstreamError::Request(msg) => write!(f, "Upstream request failed: {msg}"),
            UpstreamError::InvalidResponse(msg) => write!(f, "Invalid upstream response: {msg}"),
        }
    }
}

impl Error for UpstreamError {}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Detect faces, boxes expressed as fractions of the image size
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, UpstreamError>;
}

#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    /// Return the image with the background made transparent
    async fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, UpstreamError>;
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, UpstreamError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| UpstreamError::ImageRead(e.to_string()))?;
    Ok(buffer.into_inner())
}

/// Extra time the HTTP client allows on top of the caller's deadline
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// HTTP timeout for a call whose caller gives up after `deadline`.
///
/// Always longer than `deadline`, so a hung service surfaces as the caller's
/// timeout rather than as a request error.
pub fn client_timeout(deadline: Duration) -> Duration {
    deadline.saturating_add(CLIENT_TIMEOUT_GRACE)
}

fn build_client(deadline: Duration) -> Result<Client, Box<dyn Error + Send + Sync>> {
    let client = Client::builder()
        .timeout(client_timeout(deadline))
        .user_agent("PhotoID/1.0")
        .build()?;
    Ok(client)
}

fn request_error(e: reqwest::Error) -> UpstreamError {
    UpstreamError::Request(e.to_string())
}

/// Maps a non-success status to an error; 422 means the service could not read the image
fn check_status(status: StatusCode, service: &str) -> Result<(), UpstreamError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        return Err(UpstreamError::ImageRead(format!(
            "{service} rejected the image ({status})"
        )));
    }
    Err(UpstreamError::Request(format!(
        "{service} returned {status}"
    )))
}

#[derive(Deserialize)]
struct DetectionResponse {
    detections: Vec<Detection>,
}

/// Face detector served over HTTP.
///
/// POSTs the image as PNG and expects `{"detections": [{"bbox": {...}, "confidence": f}]}`.
pub struct HttpFaceDetector {
    client: Client,
    endpoint: String,
}

impl HttpFaceDetector {
    pub fn new(
        endpoint: impl Into<String>,
        deadline: Duration,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: build_client(deadline)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, UpstreamError> {
        let body = encode_png(image)?;
        debug!("Sending {} bytes to face detector", body.len());

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .await
            .map_err(request_error)?;

        check_status(response.status(), "face detector")?;

        let parsed: DetectionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        Ok(parsed.detections)
    }
}

/// Background remover served over HTTP. POSTs PNG, expects image bytes back.
pub struct HttpBackgroundRemover {
    client: Client,
    endpoint: String,
}

impl HttpBackgroundRemover {
    pub fn new(
        endpoint: impl Into<String>,
        deadline: Duration,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: build_client(deadline)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl BackgroundRemover for HttpBackgroundRemover {
    async fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, UpstreamError> {
        let body = encode_png(image)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .await
            .map_err(request_error)?;

        check_status(response.status(), "background remover")?;

        let bytes = response.bytes().await.map_err(request_error)?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        debug!(
            "Background remover returned {}x{} image",
            decoded.width(),
            decoded.height()
        );
        Ok(decoded.to_rgba8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_response_shape() {
        let body = r#"{"detections":[{"bbox":{"x_min":0.3,"y_min":0.2,"width":0.4,"height":0.5},"confidence":0.97}]}"#;
        let parsed: DetectionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.detections.len(), 1);
        assert_eq!(parsed.detections[0].bbox.width, 0.4);
        assert!((parsed.detections[0].confidence - 0.97).abs() < f32::EPSILON);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK, "svc").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNPROCESSABLE_ENTITY, "svc"),
            Err(UpstreamError::ImageRead(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY, "svc"),
            Err(UpstreamError::Request(_))
        ));
    }

    #[test]
    fn test_client_timeout_outlasts_deadline() {
        for deadline in [Duration::ZERO, Duration::from_millis(200), Duration::from_secs(60)] {
            assert!(client_timeout(deadline) > deadline);
        }
        assert_eq!(client_timeout(Duration::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_unreachable_detector_is_request_error() {
        let detector =
            HttpFaceDetector::new("http://127.0.0.1:9/detect", Duration::from_secs(2)).unwrap();
        let image = DynamicImage::new_rgb8(4, 4);
        let result = detector.detect(&image).await;
        assert!(matches!(result, Err(UpstreamError::Request(_))));
    }
}
