//! Per-host request spacing for search connectors.
//!
//! Each connector owns one [`RateLimiter`]. Requests to the same host are
//! spaced by at least the configured interval; a server-mandated pause
//! (`Retry-After` on HTTP 429) pushes the host's next slot further out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per host.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum honored `Retry-After` value.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Minimum-interval limiter keyed by URL host.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    // Arc lets callers drop the map shard lock before awaiting the host mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// Earliest instant the next request may start; `None` before the first.
    next_slot: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            next_slot: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter; `Duration::ZERO` disables spacing but still honors
    /// recorded server pauses.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            hosts: DashMap::new(),
        }
    }

    /// Minimum spacing between requests to one host.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }

    /// Waits until a request to `url`'s host may start, then reserves the slot.
    ///
    /// The first request to a host proceeds immediately.
    pub async fn acquire(&self, url: &str) {
        // An unbounded wait cannot be refused.
        let _ = self.acquire_within(url, Duration::MAX).await;
    }

    /// Like [`acquire`](Self::acquire), but refuses to wait longer than
    /// `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns the pending wait, without sleeping or reserving a slot, when
    /// it exceeds `max_wait`.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire_within(&self, url: &str, max_wait: Duration) -> Result<(), Duration> {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self.state(&host);
        let mut next_slot = state.next_slot.lock().await;

        if let Some(slot) = *next_slot {
            let now = Instant::now();
            if slot > now {
                let delay = slot - now;
                if delay > max_wait {
                    debug!(
                        delay_secs = delay.as_secs(),
                        max_wait_secs = max_wait.as_secs(),
                        "host pause exceeds wait budget"
                    );
                    return Err(delay);
                }
                let cumulative = state.add_cumulative_delay(delay);
                debug!(
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying rate limit delay"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive rate limiting - consider reducing query volume"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }

        *next_slot = Some(Instant::now() + self.min_interval);
        Ok(())
    }

    /// Records a server-mandated pause for `url`'s host.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self.state(&host);
        let mut next_slot = state.next_slot.lock().await;
        let until = Instant::now() + delay;
        if next_slot.is_none_or(|slot| slot < until) {
            *next_slot = Some(until);
        }
        debug!(delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Lowercased host of `url`, or `"unknown"` when it has none.
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` header: integer seconds or an HTTP-date.
///
/// Values above one hour are capped; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    Some(
        datetime
            .duration_since(std::time::SystemTime::now())
            .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
    )
}
