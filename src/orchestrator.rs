//! Request orchestration for the photo preview flow
//!
//! rate check → validate → stage → detect → gate → remove background →
//! composite → respond → cleanup. Every failure maps onto a [`PreviewError`].

use crate::cleanup_worker::{CleanupQueue, DeferredCleanup};
use crate::compositor;
use crate::config::ServiceConfig;
use crate::error::PreviewError;
use crate::face_services::{BackgroundRemover, FaceDetector, UpstreamError};
use crate::file_validator::{FileValidator, ImageKind};
use crate::output_spec::OutputSpec;
use crate::quality_gate::QualityGate;
use crate::rate_limiter::RateLimiter;
use crate::temp_files::{StagedFile, TempFileManager};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Raw upload as received from the client
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Bytes,
    pub content_type: String,
    pub filename: String,
}

/// Output selection exactly as given in the query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputQuery {
    pub output_format: Option<String>,
    pub custom_width: Option<String>,
    pub custom_height: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStage {
    Received,
    RateChecked,
    Validated,
    Staged,
    Detected,
    Gated,
    Processed,
    Composited,
    Responding,
    Cleaned,
}

impl PreviewStage {
    /// The stage that normally follows this one, `None` after `Cleaned`
    pub fn next(self) -> Option<Self> {
        use PreviewStage::*;
        match self {
            Received => Some(RateChecked),
            RateChecked => Some(Validated),
            Validated => Some(Staged),
            Staged => Some(Detected),
            Detected => Some(Gated),
            Gated => Some(Processed),
            Processed => Some(Composited),
            Composited => Some(Responding),
            Responding => Some(Cleaned),
            Cleaned => None,
        }
    }
}

impl fmt::Display for PreviewStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Rendered result ready to stream. The output file is removed through the
/// cleanup queue once `cleanup` is dropped.
pub struct PreviewOutput {
    pub spec: OutputSpec,
    pub file: tokio::fs::File,
    pub content_length: u64,
    pub cleanup: DeferredCleanup,
}

pub struct RequestOrchestrator {
    validator: FileValidator,
    quality_gate: QualityGate,
    rate_limiter: Arc<RateLimiter>,
    temp_files: Arc<TempFileManager>,
    cleanup_queue: CleanupQueue,
    detector: Arc<dyn FaceDetector>,
    background_remover: Arc<dyn BackgroundRemover>,
    upstream_timeout: Duration,
    cleanup_max_age: Duration,
    cleanup_probability: f64,
}

impl RequestOrchestrator {
    pub fn new(
        config: &ServiceConfig,
        rate_limiter: Arc<RateLimiter>,
        temp_files: Arc<TempFileManager>,
        cleanup_queue: CleanupQueue,
        detector: Arc<dyn FaceDetector>,
        background_remover: Arc<dyn BackgroundRemover>,
    ) -> Self {
        Self {
            validator: FileValidator::new(config.max_file_size),
            quality_gate: QualityGate::new(config.quality),
            rate_limiter,
            temp_files,
            cleanup_queue,
            detector,
            background_remover,
            upstream_timeout: config.upstream_timeout,
            cleanup_max_age: config.cleanup_max_age,
            cleanup_probability: config.cleanup_probability,
        }
    }

    pub fn validator(&self) -> &FileValidator {
        &self.validator
    }

    /// Full flow for callers that already hold the upload
    pub async fn process_preview(
        &self,
        client_id: &str,
        upload: UploadedFile,
        query: &OutputQuery,
    ) -> Result<PreviewOutput, PreviewError> {
        self.admit(client_id)?;
        self.process_admitted(upload, query).await
    }

    /// Rate check for a client. Runs before the upload body is read.
    pub fn admit(&self, client_id: &str) -> Result<(), PreviewError> {
        let mut stage = PreviewStage::Received;
        debug!("Preview stage: {}", stage);
        self.rate_limiter
            .check_and_record(client_id, Instant::now())
            .map_err(PreviewError::from)?;
        advance(&mut stage, PreviewStage::RateChecked);

        self.maybe_sweep();
        Ok(())
    }

    /// Everything after the rate check
    pub async fn process_admitted(
        &self,
        upload: UploadedFile,
        query: &OutputQuery,
    ) -> Result<PreviewOutput, PreviewError> {
        let started = Instant::now();
        let mut stage = PreviewStage::RateChecked;

        let result = self.run(upload, query, &mut stage).await;
        match &result {
            Ok(output) => info!(
                "Preview rendered as {} ({}x{}, {} bytes) in {:?}",
                output.spec.format,
                output.spec.width,
                output.spec.height,
                output.content_length,
                started.elapsed()
            ),
            Err(e) => debug!("Preview stopped after stage {}: {}", stage, e),
        }
        advance(&mut stage, PreviewStage::Cleaned);
        result
    }

    async fn run(
        &self,
        upload: UploadedFile,
        query: &OutputQuery,
        stage: &mut PreviewStage,
    ) -> Result<PreviewOutput, PreviewError> {
        let kind = self
            .validator
            .validate(&upload.bytes, &upload.content_type)?;
        let spec = OutputSpec::resolve(
            query.output_format.as_deref(),
            query.custom_width.as_deref(),
            query.custom_height.as_deref(),
        )?;
        advance(stage, PreviewStage::Validated);

        let handle = self.temp_files.allocate(&upload.filename);
        // Guard first, so a partially written file is removed as well
        let staged = StagedFile::new(handle.input_path.clone(), self.temp_files.clone());
        tokio::fs::write(staged.path(), &upload.bytes)
            .await
            .map_err(|e| {
                PreviewError::InternalError(format!(
                    "failed to stage upload at {}: {e}",
                    staged.path().display()
                ))
            })?;
        drop(upload);
        advance(stage, PreviewStage::Staged);

        let image = decode_staged(staged.path().to_path_buf(), kind).await?;
        let detections = self
            .call_upstream("face detector", self.detector.detect(&image))
            .await?;
        debug!("Detector returned {} faces", detections.len());
        advance(stage, PreviewStage::Detected);

        let verdict = self
            .quality_gate
            .evaluate(&detections, image.width(), image.height());
        if let Some(rejection) = PreviewError::from_verdict(verdict) {
            return Err(rejection);
        }
        advance(stage, PreviewStage::Gated);

        let foreground = self
            .call_upstream(
                "background remover",
                self.background_remover.remove_background(&image),
            )
            .await?;
        drop(image);
        advance(stage, PreviewStage::Processed);

        let cleanup = DeferredCleanup::new(handle.output_path.clone(), self.cleanup_queue.clone());
        render_output(foreground, spec, handle.output_path.clone()).await?;
        advance(stage, PreviewStage::Composited);

        let file = tokio::fs::File::open(&handle.output_path)
            .await
            .map_err(|e| PreviewError::InternalError(format!("failed to open output: {e}")))?;
        let content_length = file
            .metadata()
            .await
            .map_err(|e| PreviewError::InternalError(format!("failed to stat output: {e}")))?
            .len();

        drop(staged);
        advance(stage, PreviewStage::Responding);

        Ok(PreviewOutput {
            spec,
            file,
            content_length,
            cleanup,
        })
    }

    async fn call_upstream<T, F>(&self, service: &'static str, call: F) -> Result<T, PreviewError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        match tokio::time::timeout(self.upstream_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(UpstreamError::ImageRead(msg))) => Err(PreviewError::InvalidImage(format!(
                "{service} could not read the image: {msg}"
            ))),
            Ok(Err(e)) => Err(PreviewError::UpstreamFailure(format!("{service}: {e}"))),
            Err(_) => Err(PreviewError::UpstreamTimeout {
                service,
                after: self.upstream_timeout,
            }),
        }
    }

    fn maybe_sweep(&self) {
        if self.cleanup_probability <= 0.0 {
            return;
        }
        let triggered = rand::rng().random_bool(self.cleanup_probability.min(1.0));
        if triggered {
            debug!("Request triggered a temp sweep");
            self.cleanup_queue.schedule_sweep(self.cleanup_max_age);
        }
    }
}

/// Stages only move forward one step at a time, except that any stage may end in `Cleaned`
fn advance(stage: &mut PreviewStage, next: PreviewStage) {
    debug_assert!(
        next == PreviewStage::Cleaned || stage.next() == Some(next),
        "invalid preview stage transition {stage} -> {next}"
    );
    debug!("Preview stage: {}", next);
    *stage = next;
}

async fn decode_staged(path: PathBuf, kind: ImageKind) -> Result<DynamicImage, PreviewError> {
    tokio::task::spawn_blocking(move || {
        let mut reader = ImageReader::open(&path)
            .map_err(|e| PreviewError::InternalError(format!("failed to reopen upload: {e}")))?;
        reader.set_format(kind.image_format());
        reader
            .decode()
            .map_err(|e| PreviewError::InvalidImage(e.to_string()))
    })
    .await
    .map_err(|e| PreviewError::InternalError(format!("decode task failed: {e}")))?
}

async fn render_output(
    foreground: RgbaImage,
    spec: OutputSpec,
    output_path: PathBuf,
) -> Result<(), PreviewError> {
    tokio::task::spawn_blocking(move || {
        let composed = compositor::compose(&foreground, spec.width, spec.height);
        composed
            .save_with_format(&output_path, ImageFormat::Png)
            .map_err(|e| PreviewError::InternalError(format!("failed to write output: {e}")))
    })
    .await
    .map_err(|e| PreviewError::InternalError(format!("composite task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain_runs_from_received_to_cleaned() {
        let mut stage = PreviewStage::Received;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            advance(&mut stage, next);
            visited.push(stage);
        }
        assert_eq!(visited.len(), 10);
        assert_eq!(visited.last(), Some(&PreviewStage::Cleaned));
    }

    #[test]
    fn test_any_stage_may_end_in_cleaned() {
        let mut stage = PreviewStage::Staged;
        advance(&mut stage, PreviewStage::Cleaned);
        assert_eq!(stage, PreviewStage::Cleaned);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid preview stage transition")]
    fn test_skipping_a_stage_is_rejected() {
        let mut stage = PreviewStage::Validated;
        advance(&mut stage, PreviewStage::Gated);
    }
}
