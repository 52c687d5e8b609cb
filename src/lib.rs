pub mod cleanup_worker;
pub mod compositor;
pub mod config;
pub mod error;
pub mod face_services;
pub mod file_validator;
pub mod orchestrator;
pub mod output_spec;
pub mod photo_handlers;
pub mod quality_gate;
pub mod rate_limiter;
pub mod temp_files;

#[cfg(test)]
mod tests;

pub use cleanup_worker::{CleanupQueue, DeferredCleanup};
pub use config::ServiceConfig;
pub use error::PreviewError;
pub use face_services::{BackgroundRemover, FaceDetector, HttpBackgroundRemover, HttpFaceDetector};
pub use file_validator::{FileValidator, ImageKind, ValidationError};
pub use orchestrator::{OutputQuery, PreviewOutput, RequestOrchestrator, UploadedFile};
pub use output_spec::{OutputFormat, OutputSpec};
pub use quality_gate::{BoundingBox, Detection, QualityGate, QualityThresholds, QualityVerdict};
pub use rate_limiter::{RateLimitConfig, RateLimitExceeded, RateLimitScope, RateLimiter};
pub use temp_files::{TempFileHandle, TempFileManager};
