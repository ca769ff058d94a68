use crate::error::{FetchError, FetchErrorKind};
use crate::model::PageData;
use crate::plugins::Fetcher;
use crate::utils::validate_url;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fetches pages over HTTP(S), following a bounded number of redirects.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, max_redirects: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::limited(max_redirects))
            .build()
            .map_err(|e| FetchError::new(FetchErrorKind::Connection, e.to_string()))?;
        Ok(Self { client })
    }

    fn classify(err: &reqwest::Error) -> FetchErrorKind {
        if err.is_timeout() {
            return FetchErrorKind::Timeout;
        }
        if err.is_builder() {
            return FetchErrorKind::InvalidUrl;
        }
        if let Some(kind) = kind_from_chain(err) {
            return kind;
        }
        if err.is_status() {
            return FetchErrorKind::HttpStatus;
        }
        FetchErrorKind::Connection
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<PageData, FetchError> {
        let parsed = validate_url(url)?;
        let started = Instant::now();
        let fetched_at = Utc::now();

        let request = async {
            let response = self.client.get(parsed).send().await?;
            let final_url = response.url().to_string();
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((final_url, status, content_type, body))
        };

        let (final_url, status, content_type, body) = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::timeout(timeout))?
            .map_err(|e| FetchError::new(Self::classify(&e), error_chain(&e)))?;

        if !status.is_success() {
            return Err(FetchError::http_status(status.as_u16(), &final_url));
        }

        debug!(
            "Fetched {} ({} bytes, status {}) in {:?}",
            final_url,
            body.len(),
            status.as_u16(),
            started.elapsed()
        );

        Ok(PageData {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
            fetched_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Classify DNS and TLS failures by walking the error's source chain.
pub fn kind_from_chain(err: &(dyn StdError + 'static)) -> Option<FetchErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("no such host")
        {
            return Some(FetchErrorKind::Dns);
        }
        if text.contains("certificate")
            || text.contains("tls")
            || text.contains("ssl")
            || text.contains("handshake")
        {
            return Some(FetchErrorKind::Tls);
        }
        current = e.source();
    }
    None
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}
