//! Swappable analysis collaborators.
//!
//! The servers only ever see these traits behind `Arc<dyn ..>`, so tests can
//! substitute doubles and deployments can swap the screenshot backend.

pub mod audit;
pub mod extract;
pub mod fetch;
pub mod image_analysis;
pub mod performance;
pub mod screenshot;

pub use audit::HtmlAuditor;
pub use extract::HtmlExtractor;
pub use fetch::HttpFetcher;
pub use image_analysis::RasterImageProcessor;
pub use performance::StaticPerformanceScorer;
pub use screenshot::{ChromeScreenshotter, PlaceholderScreenshotter};

use crate::config::{ScraperConfig, ScreenshotBackend, ScreenshotSettings};
use crate::error::{AnalysisError, FetchError, ServiceError};
use crate::model::{
    AccessibilityReport, ImageAnalysis, ImageBlob, Metadata, PageData, PerformanceMetrics, SeoReport, StructuredData,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<PageData, FetchError>;
}

pub trait Extractor: Send + Sync {
    fn extract(&self, page: &PageData) -> Metadata;
}

#[async_trait]
pub trait Screenshotter: Send + Sync {
    async fn screenshot(&self, page: &PageData, timeout: Duration) -> Result<ImageBlob, AnalysisError>;
}

#[async_trait]
pub trait PerformanceScorer: Send + Sync {
    async fn score(&self, page: &PageData, timeout: Duration) -> Result<PerformanceMetrics, AnalysisError>;
}

#[async_trait]
pub trait ImageProcessor: Send + Sync {
    async fn process(&self, image: &ImageBlob, timeout: Duration) -> Result<ImageAnalysis, AnalysisError>;
}

/// Static page audits. Synchronous, callers run them off the async threads.
pub trait PageAuditor: Send + Sync {
    fn seo(&self, page: &PageData) -> SeoReport;
    fn technologies(&self, page: &PageData) -> Vec<String>;
    fn structured_data(&self, page: &PageData) -> StructuredData;
    fn accessibility(&self, page: &PageData) -> AccessibilityReport;
}

/// The scraping-side collaborators.
#[derive(Clone)]
pub struct ScrapePlugins {
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
}

impl ScrapePlugins {
    pub fn from_config(config: &ScraperConfig) -> Result<Self, ServiceError> {
        let fetcher = HttpFetcher::new(&config.user_agent, config.max_redirects)
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(HtmlExtractor),
        })
    }
}

/// The processing-side collaborators, bundled for the worker pool.
#[derive(Clone)]
pub struct AnalysisPlugins {
    pub screenshotter: Arc<dyn Screenshotter>,
    pub scorer: Arc<dyn PerformanceScorer>,
    pub image_processor: Arc<dyn ImageProcessor>,
    pub auditor: Arc<dyn PageAuditor>,
}

impl AnalysisPlugins {
    pub fn from_settings(settings: &ScreenshotSettings) -> Self {
        let screenshotter: Arc<dyn Screenshotter> = match settings.backend {
            ScreenshotBackend::Chrome => Arc::new(ChromeScreenshotter::new(settings.clone())),
            ScreenshotBackend::Placeholder => Arc::new(PlaceholderScreenshotter::new(settings.viewport.clone())),
        };
        Self {
            screenshotter,
            ..Self::placeholder()
        }
    }

    /// Every collaborator backed by in-process rendering. No browser needed.
    pub fn placeholder() -> Self {
        Self {
            screenshotter: Arc::new(PlaceholderScreenshotter::default()),
            scorer: Arc::new(StaticPerformanceScorer),
            image_processor: Arc::new(RasterImageProcessor::default()),
            auditor: Arc::new(HtmlAuditor),
        }
    }
}
