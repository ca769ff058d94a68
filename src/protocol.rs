use crate::error::{AnalysisError, ErrorDescriptor};
use crate::job::JobState;
use crate::model::{
    AccessibilityReport, ImageAnalysis, ImageBlob, Metadata, PageData, PerformanceMetrics, SeoReport, StructuredData,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Correlation identifier assigned by the scraping server to each job.
///
/// The processing server treats it as opaque text and echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Screenshot,
    Performance,
    Image,
    Seo,
    TechStack,
    StructuredData,
    Accessibility,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 7] = [
        AnalysisKind::Screenshot,
        AnalysisKind::Performance,
        AnalysisKind::Image,
        AnalysisKind::Seo,
        AnalysisKind::TechStack,
        AnalysisKind::StructuredData,
        AnalysisKind::Accessibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Screenshot => "screenshot",
            AnalysisKind::Performance => "performance",
            AnalysisKind::Image => "image",
            AnalysisKind::Seo => "seo",
            AnalysisKind::TechStack => "tech_stack",
            AnalysisKind::StructuredData => "structured_data",
            AnalysisKind::Accessibility => "accessibility",
        }
    }

    pub fn all() -> BTreeSet<AnalysisKind> {
        Self::ALL.into_iter().collect()
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown analysis kind: {s}"))
    }
}

/// Successful output of one analysis kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AnalysisPayload {
    Screenshot(ImageBlob),
    Performance(PerformanceMetrics),
    Image(ImageAnalysis),
    Seo(SeoReport),
    TechStack(Vec<String>),
    StructuredData(StructuredData),
    Accessibility(AccessibilityReport),
}

impl AnalysisPayload {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            AnalysisPayload::Screenshot(_) => AnalysisKind::Screenshot,
            AnalysisPayload::Performance(_) => AnalysisKind::Performance,
            AnalysisPayload::Image(_) => AnalysisKind::Image,
            AnalysisPayload::Seo(_) => AnalysisKind::Seo,
            AnalysisPayload::TechStack(_) => AnalysisKind::TechStack,
            AnalysisPayload::StructuredData(_) => AnalysisKind::StructuredData,
            AnalysisPayload::Accessibility(_) => AnalysisKind::Accessibility,
        }
    }
}

pub type AnalysisOutcome = Result<AnalysisPayload, AnalysisError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Ok,
    Partial,
    Failed,
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeStatus::Ok => write!(f, "OK"),
            ScrapeStatus::Partial => write!(f, "PARTIAL"),
            ScrapeStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Answer at once with a `StatusResponse` carrying the job id. The result
    /// is then only available through `StatusRequest`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detach: bool,
}

/// Terminal answer to one `ScrapeRequest`.
///
/// Analysis fields are `None` when the kind was not requested or the job
/// failed before anything was forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub url: String,
    pub status: ScrapeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Result<ImageBlob, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<Result<PerformanceMetrics, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_analysis: Option<Result<ImageAnalysis, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo: Option<Result<SeoReport, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<Result<Vec<String>, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Result<StructuredData, AnalysisError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<Result<AccessibilityReport, AnalysisError>>,
    #[serde(default)]
    pub errors: Vec<ErrorDescriptor>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ScrapeResponse {
    pub fn new(job_id: JobId, request_id: Option<String>, url: impl Into<String>) -> Self {
        Self {
            job_id,
            request_id,
            url: url.into(),
            status: ScrapeStatus::Ok,
            metadata: None,
            screenshot: None,
            performance: None,
            image_analysis: None,
            seo: None,
            tech_stack: None,
            structured_data: None,
            accessibility: None,
            errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// A terminal FAILED response carrying a single error.
    pub fn failed(
        job_id: JobId,
        request_id: Option<String>,
        url: impl Into<String>,
        error: ErrorDescriptor,
    ) -> Self {
        let mut response = Self::new(job_id, request_id, url);
        response.status = ScrapeStatus::Failed;
        response.errors.push(error);
        response
    }

    /// Store the outcome of one analysis kind in its field. Errors are also
    /// recorded in `errors`.
    pub fn apply(&mut self, kind: AnalysisKind, outcome: AnalysisOutcome) {
        let outcome = match outcome {
            Ok(payload) if payload.kind() != kind => Err(AnalysisError::failed(format!(
                "processing server returned {} payload for {}",
                payload.kind(),
                kind
            ))),
            other => other,
        };

        if let Err(error) = &outcome {
            self.errors.push(ErrorDescriptor::Analysis {
                kind,
                error: error.clone(),
            });
        }

        match (kind, outcome) {
            (AnalysisKind::Screenshot, Ok(AnalysisPayload::Screenshot(blob))) => {
                self.screenshot = Some(Ok(blob))
            }
            (AnalysisKind::Performance, Ok(AnalysisPayload::Performance(metrics))) => {
                self.performance = Some(Ok(metrics))
            }
            (AnalysisKind::Image, Ok(AnalysisPayload::Image(analysis))) => {
                self.image_analysis = Some(Ok(analysis))
            }
            (AnalysisKind::Seo, Ok(AnalysisPayload::Seo(report))) => self.seo = Some(Ok(report)),
            (AnalysisKind::TechStack, Ok(AnalysisPayload::TechStack(stack))) => {
                self.tech_stack = Some(Ok(stack))
            }
            (AnalysisKind::StructuredData, Ok(AnalysisPayload::StructuredData(items))) => {
                self.structured_data = Some(Ok(items))
            }
            (AnalysisKind::Accessibility, Ok(AnalysisPayload::Accessibility(report))) => {
                self.accessibility = Some(Ok(report))
            }
            (kind, Err(error)) => self.set_error(kind, error),
            // Mismatched payloads were converted to errors above.
            (_, Ok(_)) => {}
        }
    }

    fn set_error(&mut self, kind: AnalysisKind, error: AnalysisError) {
        match kind {
            AnalysisKind::Screenshot => self.screenshot = Some(Err(error)),
            AnalysisKind::Performance => self.performance = Some(Err(error)),
            AnalysisKind::Image => self.image_analysis = Some(Err(error)),
            AnalysisKind::Seo => self.seo = Some(Err(error)),
            AnalysisKind::TechStack => self.tech_stack = Some(Err(error)),
            AnalysisKind::StructuredData => self.structured_data = Some(Err(error)),
            AnalysisKind::Accessibility => self.accessibility = Some(Err(error)),
        }
    }

    /// Status derived from the recorded errors: OK when there are none, PARTIAL otherwise.
    pub fn settle(&mut self) {
        if self.status != ScrapeStatus::Failed {
            self.status = if self.errors.is_empty() {
                ScrapeStatus::Ok
            } else {
                ScrapeStatus::Partial
            };
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub page_data: Arc<PageData>,
    pub requested_analyses: BTreeSet<AnalysisKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub job_id: JobId,
    #[serde(default)]
    pub results: BTreeMap<AnalysisKind, AnalysisOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub seq: u64,
    #[serde(default)]
    pub ack: bool,
}

impl Heartbeat {
    pub fn request(seq: u64) -> Self {
        Self { seq, ack: false }
    }

    /// The answer to a request. Acks are never answered.
    pub fn reply(&self) -> Option<Heartbeat> {
        (!self.ack).then_some(Heartbeat {
            seq: self.seq,
            ack: true,
        })
    }
}

/// Lookup of a job by id, live or recently finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Attach the full `ScrapeResponse` once the job has finished.
    #[serde(default)]
    pub include_result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// `None` when the job is unknown or its result has expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScrapeResponse>,
}

/// Rejection of one request that leaves the connection usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub error: ErrorDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ScrapeRequest(ScrapeRequest),
    ScrapeResponse(ScrapeResponse),
    AnalysisRequest(AnalysisRequest),
    AnalysisResponse(AnalysisResponse),
    Heartbeat(Heartbeat),
    ErrorReply(ErrorReply),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::ScrapeRequest(_) => "scrape_request",
            Message::ScrapeResponse(_) => "scrape_response",
            Message::AnalysisRequest(_) => "analysis_request",
            Message::AnalysisResponse(_) => "analysis_response",
            Message::Heartbeat(_) => "heartbeat",
            Message::ErrorReply(_) => "error_reply",
            Message::StatusRequest(_) => "status_request",
            Message::StatusResponse(_) => "status_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, FetchErrorKind};
    use crate::model::ImageFormat;

    fn blob() -> ImageBlob {
        ImageBlob {
            format: ImageFormat::Png,
            width: 2,
            height: 1,
            data: vec![0x89, b'P', b'N', b'G', 0x00, 0xff],
        }
    }

    #[test]
    fn test_job_ids_are_unique() {
        let ids: BTreeSet<JobId> = (0..1000).map(|_| JobId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_analysis_kind_parse() {
        assert_eq!("tech_stack".parse::<AnalysisKind>(), Ok(AnalysisKind::TechStack));
        assert!("thumbnail".parse::<AnalysisKind>().is_err());
        assert_eq!(
            "structured_data".parse::<AnalysisKind>(),
            Ok(AnalysisKind::StructuredData)
        );
        assert_eq!(AnalysisKind::all().len(), 7);
    }

    #[test]
    fn test_heartbeat_reply() {
        let request = Heartbeat::request(7);
        let ack = request.reply().unwrap();
        assert_eq!(ack, Heartbeat { seq: 7, ack: true });
        assert!(ack.reply().is_none());
    }

    #[test]
    fn test_message_wire_tags() {
        let message = Message::Heartbeat(Heartbeat::request(1));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "heartbeat");

        let message = Message::ScrapeRequest(ScrapeRequest {
            url: "http://example.com".to_string(),
            request_id: None,
            detach: false,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "scrape_request");
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = r#"{"type":"heartbeat","seq":3,"ack":true,"sent_at":"later"}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message, Message::Heartbeat(Heartbeat { seq: 3, ack: true }));

        let raw = r#"{"type":"heartbeat","seq":4}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message, Message::Heartbeat(Heartbeat::request(4)));
    }

    #[test]
    fn test_apply_fills_fields_and_errors() {
        let mut response = ScrapeResponse::new(JobId::from("j1"), None, "http://example.com");
        response.apply(AnalysisKind::Screenshot, Ok(AnalysisPayload::Screenshot(blob())));
        response.apply(
            AnalysisKind::Performance,
            Err(AnalysisError::unavailable("connection refused")),
        );
        response.settle();

        assert_eq!(response.screenshot, Some(Ok(blob())));
        assert!(matches!(
            response.performance,
            Some(Err(AnalysisError::Unavailable { .. }))
        ));
        assert_eq!(response.status, ScrapeStatus::Partial);
        assert_eq!(response.errors.len(), 1);
    }

    #[test]
    fn test_apply_rejects_mismatched_payload() {
        let mut response = ScrapeResponse::new(JobId::from("j2"), None, "http://example.com");
        response.apply(
            AnalysisKind::Seo,
            Ok(AnalysisPayload::TechStack(vec!["React".to_string()])),
        );
        assert!(matches!(response.seo, Some(Err(AnalysisError::Failed { .. }))));
        assert!(response.tech_stack.is_none());
    }

    #[test]
    fn test_structured_data_payload_wire_shape() {
        let raw = r#"{"kind":"structured_data","data":[{"@type":"Organization","name":"Acme"}]}"#;
        let payload: AnalysisPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.kind(), AnalysisKind::StructuredData);

        let mut response = ScrapeResponse::new(JobId::from("j5"), None, "http://example.com");
        response.apply(AnalysisKind::StructuredData, Ok(payload));
        let items = response.structured_data.unwrap().unwrap();
        assert_eq!(items[0]["name"], "Acme");
    }

    #[test]
    fn test_settle_keeps_failed() {
        let mut response = ScrapeResponse::failed(
            JobId::from("j3"),
            Some("r".to_string()),
            "http://nope.invalid",
            ErrorDescriptor::Fetch(FetchError::new(FetchErrorKind::Dns, "no such host")),
        );
        response.settle();
        assert_eq!(response.status, ScrapeStatus::Failed);

        let mut clean = ScrapeResponse::new(JobId::from("j4"), None, "http://example.com");
        clean.settle();
        assert_eq!(clean.status, ScrapeStatus::Ok);
    }
}
