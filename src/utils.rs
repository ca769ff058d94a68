use crate::error::{FetchError, FetchErrorKind};
use crate::protocol::ScrapeResponse;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

/// Sliding-window request limit, tracked separately for each domain.
pub struct DomainRateLimiter {
    requests_per_window: usize,
    window_size: Duration,
    request_times: tokio::sync::Mutex<HashMap<String, Vec<Instant>>>,
}

impl DomainRateLimiter {
    /// `requests_per_minute == 0` disables limiting.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute as usize, Duration::from_secs(60))
    }

    pub fn new(requests_per_window: usize, window_size: Duration) -> Self {
        Self {
            requests_per_window,
            window_size,
            request_times: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.requests_per_window > 0
    }

    /// Record one request for `domain`. Returns false when the window is full.
    pub async fn acquire(&self, domain: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let now = Instant::now();
        let mut domains = self.request_times.lock().await;

        // Drop domains whose window has fully expired
        domains.retain(|_, times| {
            times.retain(|&time| now.duration_since(time) < self.window_size);
            !times.is_empty()
        });

        let times = domains.entry(domain.to_string()).or_default();
        if times.len() < self.requests_per_window {
            times.push(now);
            true
        } else {
            false
        }
    }

    pub async fn get_current_rate(&self, domain: &str) -> usize {
        let now = Instant::now();
        let domains = self.request_times.lock().await;

        domains
            .get(domain)
            .map(|times| {
                times
                    .iter()
                    .filter(|&&time| now.duration_since(time) < self.window_size)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Recent OK responses keyed by requested URL.
pub struct ResultCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, ScrapeResponse)>,
}

impl ResultCache {
    /// A zero `ttl` disables the cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, url: &str) -> Option<ScrapeResponse> {
        if !self.is_enabled() {
            return None;
        }

        let hit = self.entries.get(url).and_then(|entry| {
            let (stored_at, response) = entry.value();
            (stored_at.elapsed() < self.ttl).then(|| response.clone())
        });

        if hit.is_none() {
            self.entries.remove(url);
        }
        hit
    }

    /// Stores `response` and drops every expired entry.
    pub fn insert(&self, url: &str, response: &ScrapeResponse) {
        if self.is_enabled() {
            self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
            self.entries
                .insert(url.to_string(), (Instant::now(), response.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse `url` and require an http(s) scheme with a host.
pub fn validate_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url)
        .map_err(|e| FetchError::new(FetchErrorKind::InvalidUrl, format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(FetchError::new(
            FetchErrorKind::InvalidUrl,
            format!("{url}: missing host"),
        )),
        scheme => Err(FetchError::new(
            FetchErrorKind::InvalidUrl,
            format!("{url}: unsupported scheme {scheme}"),
        )),
    }
}

/// Host of `url`, used as the rate-limit key. IP literals count as domains.
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
