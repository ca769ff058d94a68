//! Configuration management with serde serialization/deserialization
//!
//! Each role (processing server, scraping server, client) has its own
//! configuration structure. All of them can be loaded from one JSON file and
//! are then overridden by command-line flags.

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::ServiceError;
use crate::protocol::AnalysisKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// A host and port pair, resolved lazily.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first socket address. Accepts IPv4, IPv6 and host names.
    pub async fn resolve(&self) -> Result<SocketAddr, ServiceError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ServiceError::Configuration(format!("cannot resolve {self}: {e}")))?
            .next()
            .ok_or_else(|| ServiceError::Configuration(format!("no address for {self}")))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Configuration of the processing server.
///
/// # Examples
///
/// ```rust
/// use page_analyzer::ProcessorConfig;
///
/// let config = ProcessorConfig {
///     max_workers: 2,
///     max_queue: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Address to listen on (default: 127.0.0.1:9000)
    pub listen: Endpoint,

    /// Analyses allowed to run at the same time (default: number of CPUs)
    pub max_workers: usize,

    /// Admitted requests allowed to wait for a worker (default: 64)
    ///
    /// Requests beyond `max_workers + max_queue` are refused with `Overloaded`.
    pub max_queue: usize,

    /// Largest accepted frame in bytes (default: 64 MiB)
    pub max_frame_bytes: usize,

    /// Close a connection after this long without inbound frames (default: 300 seconds)
    pub idle_timeout: Duration,

    /// Frames queued per connection before senders wait (default: 256)
    pub outbound_buffer: usize,

    /// Per-kind analysis deadlines
    pub timeouts: AnalysisTimeouts,

    /// Screenshot backend selection and browser settings
    pub screenshot: ScreenshotSettings,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint::new("127.0.0.1", 9000),
            max_workers: num_cpus::get(),
            max_queue: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout: Duration::from_secs(300),
            outbound_buffer: 256,
            timeouts: AnalysisTimeouts::default(),
            screenshot: ScreenshotSettings::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.max_workers == 0 {
            return Err(ServiceError::Configuration(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        validate_frame_limit(self.max_frame_bytes)?;
        validate_nonzero("idle_timeout", self.idle_timeout)?;
        self.timeouts.validate()
    }
}

/// Deadline for each analysis kind on the processing server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisTimeouts {
    /// Rendering a screenshot (default: 30 seconds)
    pub screenshot: Duration,
    /// Performance scoring (default: 10 seconds)
    pub performance: Duration,
    /// Image analysis, excluding the screenshot it waits for (default: 10 seconds)
    pub image: Duration,
    /// Markup audits such as SEO and accessibility (default: 10 seconds)
    pub audit: Duration,
}

impl Default for AnalysisTimeouts {
    fn default() -> Self {
        Self {
            screenshot: Duration::from_secs(30),
            performance: Duration::from_secs(10),
            image: Duration::from_secs(10),
            audit: Duration::from_secs(10),
        }
    }
}

impl AnalysisTimeouts {
    pub fn for_kind(&self, kind: AnalysisKind) -> Duration {
        match kind {
            AnalysisKind::Screenshot => self.screenshot,
            AnalysisKind::Performance => self.performance,
            AnalysisKind::Image => self.image,
            AnalysisKind::Seo | AnalysisKind::TechStack | AnalysisKind::StructuredData | AnalysisKind::Accessibility => {
                self.audit
            }
        }
    }

    /// Every kind given the same deadline.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            screenshot: timeout,
            performance: timeout,
            image: timeout,
            audit: timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        for kind in AnalysisKind::ALL {
            validate_nonzero(kind.as_str(), self.for_kind(kind))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScreenshotBackend {
    /// Headless Chrome via the DevTools protocol, with placeholder fallback
    Chrome,
    /// In-process rendering, no browser required
    Placeholder,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenshotSettings {
    pub backend: ScreenshotBackend,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Browser viewport used for rendering
    pub viewport: Viewport,

    /// Custom User-Agent for the rendering browser
    pub user_agent: Option<String>,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            backend: ScreenshotBackend::Chrome,
            chrome_path: None,
            viewport: Viewport::default(),
            user_agent: None,
        }
    }
}

/// Browser viewport configuration for screenshots
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 800)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// What happens to in-flight jobs when their client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Let jobs run to completion and discard their responses
    #[default]
    Continue,
    /// Abort the connection's jobs immediately
    Cancel,
}

/// Configuration of the scraping server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Address to listen on for clients (default: 127.0.0.1:8000)
    pub listen: Endpoint,

    /// Processing server to forward analyses to (default: 127.0.0.1:9000)
    pub processor: Endpoint,

    /// Analyses forwarded for every job (default: all kinds)
    pub analyses: BTreeSet<AnalysisKind>,

    /// Deadline for fetching the target page (default: 30 seconds)
    pub fetch_timeout: Duration,

    /// Deadline for the processing server's answer to one job (default: 60 seconds)
    pub forward_timeout: Duration,

    /// Deadline for opening the upstream connection (default: 5 seconds)
    pub connect_timeout: Duration,

    /// Heartbeat period on the upstream link (default: 5 seconds)
    pub heartbeat_interval: Duration,

    /// Upstream declared dead after this long without inbound frames (default: 15 seconds)
    pub heartbeat_timeout: Duration,

    /// Close a client connection after this long without requests (default: 300 seconds)
    pub idle_timeout: Duration,

    /// Requests per domain per minute, 0 for unlimited (default: 0)
    pub rate_limit_per_minute: u32,

    /// Lifetime of cached OK responses, zero disables the cache (default: 0)
    pub cache_ttl: Duration,

    /// How long finished results stay available to status lookups (default: 300 seconds)
    pub result_ttl: Duration,

    pub on_disconnect: DisconnectPolicy,

    /// User-Agent sent when fetching pages
    pub user_agent: String,

    /// Redirects followed before a fetch fails (default: 10)
    pub max_redirects: usize,

    /// Largest accepted frame in bytes (default: 64 MiB)
    pub max_frame_bytes: usize,

    /// Frames queued per connection before senders wait (default: 256)
    pub outbound_buffer: usize,

    /// Consecutive upstream connect failures before reconnects pause (default: 5)
    pub breaker_threshold: usize,

    /// Pause before trying a failing upstream again (default: 10 seconds)
    pub breaker_recovery: Duration,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint::new("127.0.0.1", 8000),
            processor: Endpoint::new("127.0.0.1", 9000),
            analyses: AnalysisKind::all(),
            fetch_timeout: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            rate_limit_per_minute: 0,
            cache_ttl: Duration::ZERO,
            result_ttl: Duration::from_secs(300),
            on_disconnect: DisconnectPolicy::Continue,
            user_agent: format!("page-analyzer/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_buffer: 256,
            breaker_threshold: 5,
            breaker_recovery: Duration::from_secs(10),
        }
    }
}

impl ScraperConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_frame_limit(self.max_frame_bytes)?;
        validate_nonzero("fetch_timeout", self.fetch_timeout)?;
        validate_nonzero("forward_timeout", self.forward_timeout)?;
        validate_nonzero("connect_timeout", self.connect_timeout)?;
        validate_nonzero("heartbeat_interval", self.heartbeat_interval)?;
        validate_nonzero("idle_timeout", self.idle_timeout)?;
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ServiceError::Configuration(
                "heartbeat_timeout must be longer than heartbeat_interval".to_string(),
            ));
        }
        if self.listen == self.processor {
            return Err(ServiceError::Configuration(format!(
                "scraper and processor cannot share address {}",
                self.listen
            )));
        }
        Ok(())
    }
}

/// Configuration of the command-line client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Scraping server to talk to (default: 127.0.0.1:8000)
    pub server: Endpoint,

    /// Wait for the response at most this long (default: 120 seconds)
    pub timeout: Duration,

    /// Deadline for opening the connection (default: 5 seconds)
    pub connect_timeout: Duration,

    /// Largest accepted frame in bytes (default: 64 MiB)
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: Endpoint::new("127.0.0.1", 8000),
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_frame_limit(self.max_frame_bytes)?;
        validate_nonzero("timeout", self.timeout)?;
        validate_nonzero("connect_timeout", self.connect_timeout)
    }
}

/// Contents of a `--config` file. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub processor: ProcessorConfig,
    pub scraper: ScraperConfig,
    pub client: ClientConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn validate_nonzero(name: &str, value: Duration) -> Result<(), ServiceError> {
    if value.is_zero() {
        return Err(ServiceError::Configuration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

fn validate_frame_limit(max_frame_bytes: usize) -> Result<(), ServiceError> {
    if max_frame_bytes < 1024 || max_frame_bytes > u32::MAX as usize {
        return Err(ServiceError::Configuration(format!(
            "max_frame_bytes must be between 1024 and {}",
            u32::MAX
        )));
    }
    Ok(())
}

/// Chrome command-line arguments for headless rendering.
pub fn get_chrome_args(settings: &ScreenshotSettings) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        format!(
            "--window-size={},{}",
            settings.viewport.width, settings.viewport.height
        ),
        format!("--user-data-dir=/tmp/page-analyzer-chrome-{unique_id}"),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    settings: &ScreenshotSettings,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;
    use chromiumoxide::handler::viewport::Viewport as DevtoolsViewport;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.viewport.width, settings.viewport.height)
        .viewport(DevtoolsViewport {
            width: settings.viewport.width,
            height: settings.viewport.height,
            device_scale_factor: Some(settings.viewport.device_scale_factor),
            emulating_mobile: settings.viewport.mobile,
            is_landscape: settings.viewport.width >= settings.viewport.height,
            has_touch: settings.viewport.mobile,
        })
        .args(get_chrome_args(settings));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ProcessorConfig::default().validate().is_ok());
        assert!(ScraperConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = ProcessorConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServiceError::Configuration(_))));

        let config = ScraperConfig {
            heartbeat_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ScraperConfig {
            processor: Endpoint::new("127.0.0.1", 8000),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            max_frame_bytes: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_config() {
        let raw = r#"{
            "scraper": {"rate_limit_per_minute": 30, "on_disconnect": "cancel"},
            "processor": {"max_queue": 3, "screenshot": {"backend": "placeholder"}}
        }"#;
        let config: FileConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.scraper.rate_limit_per_minute, 30);
        assert_eq!(config.scraper.on_disconnect, DisconnectPolicy::Cancel);
        assert_eq!(config.scraper.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.processor.max_queue, 3);
        assert_eq!(config.processor.screenshot.backend, ScreenshotBackend::Placeholder);
        assert_eq!(config.client.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("127.0.0.1", 80).to_string(), "127.0.0.1:80");
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_endpoint_resolves_literal_ip() {
        let addr = Endpoint::new("127.0.0.1", 4242).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4242".parse().unwrap());
    }

    #[test]
    fn test_chrome_args_include_viewport() {
        let settings = ScreenshotSettings::default();
        let args = get_chrome_args(&settings);
        assert!(args.contains(&"--window-size=1280,800".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));
    }

    #[test]
    fn test_analysis_timeouts_per_kind() {
        let timeouts = AnalysisTimeouts::default();
        assert_eq!(timeouts.for_kind(AnalysisKind::Screenshot), Duration::from_secs(30));
        assert_eq!(timeouts.for_kind(AnalysisKind::TechStack), timeouts.audit);
        assert!(AnalysisTimeouts::uniform(Duration::ZERO).validate().is_err());
    }
}
