use crate::error::AnalysisError;
use crate::model::{PageData, PerformanceMetrics};
use crate::plugins::extract::select_all;
use crate::plugins::PerformanceScorer;
use async_trait::async_trait;
use scraper::Html;
use std::time::Duration;

/// Scores a page from the fetch it already went through, without reloading it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPerformanceScorer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    pub scripts: usize,
    pub stylesheets: usize,
    pub images: usize,
}

impl ResourceCounts {
    pub fn from_html(html: &str) -> Self {
        let document = Html::parse_document(html);
        Self {
            scripts: select_all(&document, "script[src]").len(),
            stylesheets: select_all(&document, "link[rel~=stylesheet][href]").len(),
            images: select_all(&document, "img[src]").len(),
        }
    }

    /// The page itself plus every external resource it references.
    pub fn requests(&self) -> usize {
        1 + self.scripts + self.stylesheets + self.images
    }
}

#[async_trait]
impl PerformanceScorer for StaticPerformanceScorer {
    async fn score(&self, page: &PageData, timeout: Duration) -> Result<PerformanceMetrics, AnalysisError> {
        let html = page.html().into_owned();
        let counts = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || ResourceCounts::from_html(&html)),
        )
        .await
        .map_err(|_| AnalysisError::timeout(timeout))?
        .map_err(AnalysisError::failed)?;

        Ok(metrics_for(page.elapsed_ms, page.body.len(), counts))
    }
}

pub fn metrics_for(elapsed_ms: u64, body_len: usize, counts: ResourceCounts) -> PerformanceMetrics {
    let load_time_ms = elapsed_ms.max(1);
    let total_size_kb = body_len as f64 / 1024.0;
    let num_requests = counts.requests();

    PerformanceMetrics {
        load_time_ms,
        total_size_kb,
        num_requests,
        script_count: counts.scripts,
        stylesheet_count: counts.stylesheets,
        image_count: counts.images,
        score: score(load_time_ms, total_size_kb, num_requests),
    }
}

/// 100 minus penalties for slow loads (over 1s), heavy pages (over 500 KB)
/// and many requests (over 20).
pub fn score(load_time_ms: u64, total_size_kb: f64, num_requests: usize) -> u8 {
    let time_penalty = (load_time_ms.saturating_sub(1000) / 100).min(40) as i64;
    let size_penalty = (((total_size_kb - 500.0).max(0.0) / 50.0) as i64).min(30);
    let request_penalty = (num_requests.saturating_sub(20) as i64).min(30);
    (100 - time_penalty - size_penalty - request_penalty).clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_counts_external_resources() {
        let html = r#"<html><head>
            <script src="a.js"></script><script>inline()</script>
            <link rel="stylesheet" href="a.css"><link rel="icon" href="f.ico">
        </head><body><img src="x.png"><img src="y.png"></body></html>"#;
        let counts = ResourceCounts::from_html(html);
        assert_eq!(
            counts,
            ResourceCounts {
                scripts: 1,
                stylesheets: 1,
                images: 2
            }
        );
        assert_eq!(counts.requests(), 5);
    }

    #[test]
    fn test_fast_small_page_scores_full() {
        assert_eq!(score(200, 12.0, 3), 100);
    }

    #[test]
    fn test_penalties_are_capped() {
        assert_eq!(score(1500, 0.0, 1), 95);
        assert_eq!(score(60_000, 10_000.0, 500), 0);
        assert_eq!(score(1000, 600.0, 25), 93);
    }

    #[test]
    fn test_load_time_never_zero() {
        let metrics = metrics_for(0, 2048, ResourceCounts::default());
        assert_eq!(metrics.load_time_ms, 1);
        assert_eq!(metrics.total_size_kb, 2.0);
        assert_eq!(metrics.num_requests, 1);
    }

    #[tokio::test]
    async fn test_score_page() {
        let page = PageData {
            url: "http://example.com".to_string(),
            final_url: "http://example.com/".to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: b"<html><script src='app.js'></script></html>".to_vec(),
            fetched_at: Utc::now(),
            elapsed_ms: 120,
        };
        let metrics = StaticPerformanceScorer
            .score(&page, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(metrics.script_count, 1);
        assert_eq!(metrics.load_time_ms, 120);
        assert_eq!(metrics.score, 100);
    }
}
