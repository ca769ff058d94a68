use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Raw result of fetching one page. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageData {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl PageData {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn html(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_html(&self) -> bool {
        match &self.content_type {
            Some(ct) => ct.to_ascii_lowercase().contains("html"),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }
}

/// Encoded image bytes. Carried as base64 text on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBlob {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingCounts {
    pub h1: usize,
    pub h2: usize,
    pub h3: usize,
    pub h4: usize,
    pub h5: usize,
    pub h6: usize,
}

impl HeadingCounts {
    pub fn increment(&mut self, level: u8) {
        match level {
            1 => self.h1 += 1,
            2 => self.h2 += 1,
            3 => self.h3 += 1,
            4 => self.h4 += 1,
            5 => self.h5 += 1,
            6 => self.h6 += 1,
            _ => {}
        }
    }
}

/// Structural information extracted locally by the scraping server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub meta_tags: BTreeMap<String, String>,
    pub links: Vec<String>,
    pub image_urls: Vec<String>,
    pub headings: HeadingCounts,
    pub images_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub load_time_ms: u64,
    pub total_size_kb: f64,
    pub num_requests: usize,
    pub script_count: usize,
    pub stylesheet_count: usize,
    pub image_count: usize,
    /// 0 (worst) to 100 (best).
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub mean_brightness: f64,
    pub dominant_color: [u8; 3],
    pub thumbnail: ImageBlob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeoReport {
    pub title_length: usize,
    pub meta_description_length: usize,
    pub h1_count: usize,
    pub has_canonical: bool,
    pub has_robots: bool,
    pub has_open_graph: bool,
    pub score: u8,
}

/// JSON-LD objects found in `application/ld+json` scripts, in document order.
pub type StructuredData = Vec<serde_json::Map<String, serde_json::Value>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityReport {
    /// `src` of every image without a non-blank `alt`.
    pub images_missing_alt: Vec<String>,
    /// `href` of every link without visible text.
    pub links_without_text: Vec<String>,
    /// Document-order index of every button without visible text.
    pub buttons_without_text: Vec<usize>,
    pub contrast_warnings: Vec<String>,
    /// 100 minus 10 per issue, floored at 0.
    pub score: u8,
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_page() -> PageData {
        PageData {
            url: "http://example.com".to_string(),
            final_url: "http://example.com/".to_string(),
            status: 200,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: b"<html><title>Hi</title></html>".to_vec(),
            fetched_at: Utc::now(),
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_body_is_base64_on_the_wire() {
        let page = sample_page();
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["body"], "PGh0bWw+PHRpdGxlPkhpPC90aXRsZT48L2h0bWw+");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let mut json = serde_json::to_value(sample_page()).unwrap();
        json["body"] = serde_json::Value::String("not base64!!".to_string());
        assert!(serde_json::from_value::<PageData>(json).is_err());
    }

    #[test]
    fn test_html_lossy_and_content_type() {
        let mut page = sample_page();
        assert!(page.is_html());
        assert!(page.html().contains("<title>Hi</title>"));

        page.content_type = Some("image/png".to_string());
        page.body = vec![0xff, 0xfe, b'a'];
        assert!(!page.is_html());
        assert!(page.html().ends_with('a'));
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let metadata: Metadata = serde_json::from_str(r#"{"title":"x"}"#).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("x"));
        assert!(metadata.links.is_empty());
        assert_eq!(metadata.headings, HeadingCounts::default());
    }
}
