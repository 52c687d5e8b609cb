//! Per-client sliding window rate limiting (hourly and daily)

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const HOURLY_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub hourly_limit: usize,
    pub daily_limit: usize,
    /// Skip every check and record nothing
    pub bypass: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 3,
            daily_limit: 10,
            bypass: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Hourly,
    Daily,
}

impl RateLimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::Hourly => "hourly",
            RateLimitScope::Daily => "daily",
        }
    }

    pub fn window(self) -> Duration {
        match self {
            RateLimitScope::Hourly => HOURLY_WINDOW,
            RateLimitScope::Daily => DAILY_WINDOW,
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub scope: RateLimitScope,
    pub limit: usize,
    pub retry_after: Duration,
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} limit of {} requests exceeded, retry after {:?}",
            self.scope, self.limit, self.retry_after
        )
    }
}

impl Error for RateLimitExceeded {}

/// Request timestamps for one client, oldest first
#[derive(Debug, Default)]
struct ClientWindow {
    hourly: VecDeque<Instant>,
    daily: VecDeque<Instant>,
}

impl ClientWindow {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.hourly, now, HOURLY_WINDOW);
        prune_window(&mut self.daily, now, DAILY_WINDOW);
    }

    fn is_empty(&self) -> bool {
        self.hourly.is_empty() && self.daily.is_empty()
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= length {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after(window: &VecDeque<Instant>, now: Instant, length: Duration) -> Duration {
    window
        .front()
        .map(|&oldest| length.saturating_sub(now.saturating_duration_since(oldest)))
        .unwrap_or_default()
}

/// Tracks request timestamps per client across an hourly and a daily window.
///
/// Prune, count and append happen under one lock so concurrent requests from the
/// same client can never be admitted past the limit together.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        if config.bypass {
            info!("Rate limiting bypassed (test mode)");
        }
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Admit the request and record it, or report which window is full
    pub fn check_and_record(&self, client_id: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        if self.config.bypass {
            return Ok(());
        }

        let mut clients = self.clients.lock();
        let window = clients.entry(client_id.to_string()).or_default();
        window.prune(now);

        if window.daily.len() >= self.config.daily_limit {
            let exceeded = RateLimitExceeded {
                scope: RateLimitScope::Daily,
                limit: self.config.daily_limit,
                retry_after: retry_after(&window.daily, now, DAILY_WINDOW),
            };
            debug!("Client {} rejected: {}", client_id, exceeded);
            return Err(exceeded);
        }

        if window.hourly.len() >= self.config.hourly_limit {
            let exceeded = RateLimitExceeded {
                scope: RateLimitScope::Hourly,
                limit: self.config.hourly_limit,
                retry_after: retry_after(&window.hourly, now, HOURLY_WINDOW),
            };
            debug!("Client {} rejected: {}", client_id, exceeded);
            return Err(exceeded);
        }

        window.hourly.push_back(now);
        window.daily.push_back(now);
        debug!(
            "Client {} admitted ({} this hour, {} today)",
            client_id,
            window.hourly.len(),
            window.daily.len()
        );
        Ok(())
    }

    /// Number of requests currently counted for a client as (hourly, daily)
    pub fn usage(&self, client_id: &str, now: Instant) -> (usize, usize) {
        let mut clients = self.clients.lock();
        match clients.get_mut(client_id) {
            Some(window) => {
                window.prune(now);
                (window.hourly.len(), window.daily.len())
            }
            None => (0, 0),
        }
    }

    /// Drop clients whose windows have fully expired, returns how many were removed
    pub fn prune_idle(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, window| {
            window.prune(now);
            !window.is_empty()
        });
        before - clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
