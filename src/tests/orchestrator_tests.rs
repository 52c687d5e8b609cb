use super::fakes::{centered_face, portrait_bytes, DetectorBehavior, FakeDetector, FakeRemover};
use crate::cleanup_worker::CleanupQueue;
use crate::config::ServiceConfig;
use crate::error::PreviewError;
use crate::orchestrator::{OutputQuery, RequestOrchestrator, UploadedFile};
use crate::quality_gate::{BoundingBox, Detection};
use crate::rate_limiter::{RateLimitConfig, RateLimitScope, RateLimiter};
use crate::temp_files::TempFileManager;
use bytes::Bytes;
use image::ImageFormat;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Harness {
    orchestrator: Arc<RequestOrchestrator>,
    detector: Arc<FakeDetector>,
    remover: Arc<FakeRemover>,
    temp_dir: TempDir,
    _token: CancellationToken,
}

fn harness_with(
    detector: FakeDetector,
    remover: FakeRemover,
    rate_limit: RateLimitConfig,
    upstream_timeout: Duration,
) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let config = ServiceConfig {
        temp_dir: temp_dir.path().to_path_buf(),
        cleanup_probability: 0.0,
        upstream_timeout,
        rate_limit,
        ..ServiceConfig::default()
    };
    build_harness(temp_dir, config, detector, remover)
}

fn build_harness(
    temp_dir: TempDir,
    config: ServiceConfig,
    detector: FakeDetector,
    remover: FakeRemover,
) -> Harness {
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let temp_files = Arc::new(TempFileManager::new(config.temp_dir.clone()));
    let queue = CleanupQueue::spawn(temp_files.clone(), 16, token.clone(), &tracker);

    let detector = Arc::new(detector);
    let remover = Arc::new(remover);
    let orchestrator = Arc::new(RequestOrchestrator::new(
        &config,
        Arc::new(RateLimiter::new(config.rate_limit)),
        temp_files,
        queue,
        detector.clone(),
        remover.clone(),
    ));

    Harness {
        orchestrator,
        detector,
        remover,
        temp_dir,
        _token: token,
    }
}

fn harness(detector: FakeDetector) -> Harness {
    harness_with(
        detector,
        FakeRemover::working(),
        RateLimitConfig {
            bypass: true,
            ..RateLimitConfig::default()
        },
        Duration::from_millis(200),
    )
}

fn jpeg_upload() -> UploadedFile {
    UploadedFile {
        bytes: Bytes::from(portrait_bytes(ImageFormat::Jpeg)),
        content_type: "image/jpeg".to_string(),
        filename: "portrait.jpg".to_string(),
    }
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

async fn wait_for_count(dir: &Path, count: usize) -> bool {
    for _ in 0..100 {
        if files_in(dir) == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_empty(dir: &Path) -> bool {
    wait_for_count(dir, 0).await
}

fn write_aged(path: &Path, age: Duration) {
    std::fs::write(path, b"stale").unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[tokio::test]
async fn test_accepted_photo_renders_passport_eu() {
    let h = harness(FakeDetector::faces(vec![centered_face()]));

    let query = OutputQuery {
        output_format: Some("passport_eu".to_string()),
        ..OutputQuery::default()
    };
    let mut output = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &query)
        .await
        .unwrap();

    let mut png = Vec::new();
    output.file.read_to_end(&mut png).await.unwrap();
    assert_eq!(png.len() as u64, output.content_length);

    let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (413, 531));
    assert!(!decoded.color().has_alpha());

    // Input goes right away, the output waits for the response to finish
    assert!(wait_for_count(h.temp_dir.path(), 1).await);
    drop(output);
    assert!(wait_for_empty(h.temp_dir.path()).await);
}

#[tokio::test]
async fn test_custom_size_output() {
    let h = harness(FakeDetector::faces(vec![centered_face()]));
    let query = OutputQuery {
        output_format: Some("custom".to_string()),
        custom_width: Some("320".to_string()),
        custom_height: Some("240".to_string()),
    };
    let output = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &query)
        .await
        .unwrap();
    assert_eq!((output.spec.width, output.spec.height), (320, 240));
}

#[tokio::test]
async fn test_no_face_rejected_and_cleaned() {
    let h = harness(FakeDetector::faces(Vec::new()));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, PreviewError::NoFace));
    assert!(err.detail().contains("clearly visible"));
    assert_eq!(h.remover.calls.load(Ordering::SeqCst), 0);
    assert!(wait_for_empty(h.temp_dir.path()).await);
}

#[tokio::test]
async fn test_multiple_faces_rejected() {
    let h = harness(FakeDetector::faces(vec![centered_face(), centered_face()]));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::MultipleFaces));
    assert!(err.detail().contains("only one person"));
}

#[tokio::test]
async fn test_face_at_edge_rejected() {
    let edge = Detection {
        bbox: BoundingBox {
            x_min: 0.0,
            y_min: 0.2,
            width: 0.5,
            height: 0.5,
        },
        confidence: 0.9,
    };
    let h = harness(FakeDetector::faces(vec![edge]));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::FaceTooCloseToEdge));
}

#[tokio::test]
async fn test_format_mismatch_never_staged() {
    let h = harness(FakeDetector::faces(vec![centered_face()]));
    let upload = UploadedFile {
        content_type: "image/png".to_string(),
        ..jpeg_upload()
    };
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", upload, &OutputQuery::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, PreviewError::FormatMismatch { .. }));
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(files_in(h.temp_dir.path()), 0);
}

#[tokio::test]
async fn test_bad_parameters_rejected_before_staging() {
    let h = harness(FakeDetector::faces(vec![centered_face()]));
    let query = OutputQuery {
        output_format: Some("custom".to_string()),
        custom_width: Some("5000".to_string()),
        custom_height: Some("100".to_string()),
    };
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &query)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::InvalidParameter(_)));
    assert_eq!(files_in(h.temp_dir.path()), 0);
}

#[tokio::test]
async fn test_upstream_failures() {
    let h = harness(FakeDetector::new(DetectorBehavior::Fail));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::UpstreamFailure(_)));
    assert!(!err.detail().contains("offline"));
    assert!(wait_for_empty(h.temp_dir.path()).await);

    let h = harness_with(
        FakeDetector::faces(vec![centered_face()]),
        FakeRemover::failing(),
        RateLimitConfig {
            bypass: true,
            ..RateLimitConfig::default()
        },
        Duration::from_millis(200),
    );
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::UpstreamFailure(_)));
    assert!(wait_for_empty(h.temp_dir.path()).await);
}

#[tokio::test]
async fn test_unreadable_image_reported_as_invalid() {
    let h = harness(FakeDetector::new(DetectorBehavior::Unreadable));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PreviewError::InvalidImage(_)));
}

#[tokio::test]
async fn test_upstream_timeout() {
    let h = harness(FakeDetector::new(DetectorBehavior::Hang));
    let err = h
        .orchestrator
        .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PreviewError::UpstreamTimeout {
            service: "face detector",
            ..
        }
    ));
    assert!(wait_for_empty(h.temp_dir.path()).await);
}

#[tokio::test]
async fn test_fourth_request_in_hour_rate_limited() {
    let h = harness_with(
        FakeDetector::faces(vec![centered_face()]),
        FakeRemover::working(),
        RateLimitConfig::default(),
        Duration::from_millis(200),
    );

    for _ in 0..3 {
        let output = h
            .orchestrator
            .process_preview("10.0.0.7", jpeg_upload(), &OutputQuery::default())
            .await;
        assert!(output.is_ok());
    }

    let err = h
        .orchestrator
        .process_preview("10.0.0.7", jpeg_upload(), &OutputQuery::default())
        .await
        .err()
        .unwrap();
    match err {
        PreviewError::RateLimitExceeded(exceeded) => {
            assert_eq!(exceeded.scope, RateLimitScope::Hourly);
            assert_eq!(exceeded.limit, 3);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancelled_request_removes_staged_input() {
    let h = harness_with(
        FakeDetector::new(DetectorBehavior::Hang),
        FakeRemover::working(),
        RateLimitConfig {
            bypass: true,
            ..RateLimitConfig::default()
        },
        // Only the abort ends this request
        Duration::from_secs(60),
    );
    let orchestrator = h.orchestrator.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .process_preview("10.0.0.1", jpeg_upload(), &OutputQuery::default())
            .await
            .is_ok()
    });

    // Wait until the upload is staged and the detector call is pending
    let mut staged = false;
    for _ in 0..100 {
        if h.detector.calls.load(Ordering::SeqCst) > 0 {
            staged = files_in(h.temp_dir.path()) == 1;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(staged);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(wait_for_empty(h.temp_dir.path()).await);
}

#[tokio::test]
async fn test_admitted_request_triggers_sweep_of_stale_files() {
    let temp_dir = TempDir::new().unwrap();
    let config = ServiceConfig {
        temp_dir: temp_dir.path().to_path_buf(),
        cleanup_probability: 1.0,
        cleanup_max_age: Duration::from_secs(300),
        rate_limit: RateLimitConfig {
            bypass: true,
            ..RateLimitConfig::default()
        },
        ..ServiceConfig::default()
    };
    let h = build_harness(
        temp_dir,
        config,
        FakeDetector::faces(vec![centered_face()]),
        FakeRemover::working(),
    );

    let orphan = h.temp_dir.path().join("deadbeef_processed.png");
    let fresh = h.temp_dir.path().join("cafebabe_portrait.jpg");
    write_aged(&orphan, Duration::from_secs(600));
    std::fs::write(&fresh, b"in flight").unwrap();

    h.orchestrator.admit("10.0.0.1").unwrap();

    assert!(wait_for_count(h.temp_dir.path(), 1).await);
    assert!(!orphan.exists());
    assert!(fresh.exists());
}
