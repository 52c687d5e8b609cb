//! Service configuration, loaded from environment variables

use crate::file_validator::DEFAULT_MAX_FILE_SIZE;
use crate::quality_gate::QualityThresholds;
use crate::rate_limiter::RateLimitConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Slack for decoding, compositing and streaming on top of both upstream calls
const REQUEST_OVERHEAD: Duration = Duration::from_secs(60);

/// Youngest age a sweep may delete: a request makes two upstream calls, each
/// bounded by `upstream_timeout`, so its files are never older than this.
pub fn min_cleanup_max_age(upstream_timeout: Duration) -> Duration {
    upstream_timeout
        .saturating_mul(2)
        .saturating_add(REQUEST_OVERHEAD)
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP server listens on (default: 127.0.0.1:8000)
    pub bind_addr: String,
    /// Upload size limit in bytes
    pub max_file_size: usize,
    /// Directory for staged uploads and rendered outputs
    pub temp_dir: PathBuf,
    /// Files older than this are removed by sweeps
    pub cleanup_max_age: Duration,
    /// Chance that a request triggers a sweep, in [0, 1]
    pub cleanup_probability: f64,
    /// Time between scheduled sweeps, zero disables them
    pub cleanup_interval: Duration,
    pub cleanup_queue_size: usize,
    pub rate_limit: RateLimitConfig,
    pub quality: QualityThresholds,
    /// Deadline for each call to a model service
    pub upstream_timeout: Duration,
    pub face_detector_url: Option<String>,
    pub background_remover_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            temp_dir: PathBuf::from("uploads/temp"),
            cleanup_max_age: Duration::from_secs(3600),
            cleanup_probability: 0.01,
            cleanup_interval: Duration::from_secs(600),
            cleanup_queue_size: 1024,
            rate_limit: RateLimitConfig::default(),
            quality: QualityThresholds::default(),
            upstream_timeout: Duration::from_secs(60),
            face_detector_url: None,
            background_remover_url: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment (call `dotenv` first to honour `.env`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rate_limit = RateLimitConfig {
            hourly_limit: parse_or(&lookup, "RATE_LIMIT_HOURLY", defaults.rate_limit.hourly_limit),
            daily_limit: parse_or(&lookup, "RATE_LIMIT_DAILY", defaults.rate_limit.daily_limit),
            bypass: lookup("TEST_MODE").map(|v| parse_flag(&v)).unwrap_or(false),
        };

        let quality = QualityThresholds {
            min_face_ratio: parse_or(
                &lookup,
                "QUALITY_MIN_FACE_RATIO",
                defaults.quality.min_face_ratio,
            ),
            edge_margin: parse_or(&lookup, "QUALITY_EDGE_MARGIN", defaults.quality.edge_margin),
        };

        let cleanup_probability: f64 = parse_or(
            &lookup,
            "CLEANUP_PROBABILITY",
            defaults.cleanup_probability,
        );

        let mut config = Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_file_size: parse_or(&lookup, "MAX_FILE_SIZE", defaults.max_file_size),
            temp_dir: lookup("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            cleanup_max_age: Duration::from_secs(parse_or(
                &lookup,
                "CLEANUP_MAX_AGE_SECONDS",
                defaults.cleanup_max_age.as_secs(),
            )),
            cleanup_probability: if cleanup_probability.is_nan() {
                defaults.cleanup_probability
            } else {
                cleanup_probability.clamp(0.0, 1.0)
            },
            cleanup_interval: Duration::from_secs(parse_or(
                &lookup,
                "CLEANUP_INTERVAL_SECONDS",
                defaults.cleanup_interval.as_secs(),
            )),
            cleanup_queue_size: parse_or(&lookup, "CLEANUP_QUEUE_SIZE", defaults.cleanup_queue_size),
            rate_limit,
            quality,
            upstream_timeout: Duration::from_secs(parse_or(
                &lookup,
                "UPSTREAM_TIMEOUT_SECONDS",
                defaults.upstream_timeout.as_secs(),
            )),
            face_detector_url: lookup("FACE_DETECTOR_URL").filter(|v| !v.trim().is_empty()),
            background_remover_url: lookup("BACKGROUND_REMOVER_URL")
                .filter(|v| !v.trim().is_empty()),
        };

        let floor = min_cleanup_max_age(config.upstream_timeout);
        if config.cleanup_max_age < floor {
            warn!(
                "CLEANUP_MAX_AGE_SECONDS={} would let sweeps delete files of in-flight requests, raising it to {}",
                config.cleanup_max_age.as_secs(),
                floor.as_secs()
            );
            config.cleanup_max_age = floor;
        }
        config
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using default {:?}", raw, key, default);
            default
        }),
        None => default,
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
