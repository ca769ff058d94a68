//! The front tier: accepts client jobs, fetches pages and aggregates results.

use crate::codec::Codec;
use crate::config::{DisconnectPolicy, ScraperConfig};
use crate::connection::{Connection, FrameSender};
use crate::error::{AnalysisError, ErrorDescriptor, FramingError, ServiceError};
use crate::job::{Job, JobRegistration, JobState, JobTable};
use crate::metrics::Metrics;
use crate::model::Metadata;
use crate::plugins::{Extractor, Fetcher, ScrapePlugins};
use crate::processing_client::ProcessingClient;
use crate::protocol::{
    AnalysisKind, AnalysisRequest, ErrorReply, Message, ScrapeRequest, ScrapeResponse, ScrapeStatus, StatusRequest,
    StatusResponse,
};
use crate::utils::{extract_domain, format_duration, validate_url, DomainRateLimiter, ResultCache};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub struct ScrapingServer {
    listener: TcpListener,
    service: Arc<ScrapeService>,
}

impl ScrapingServer {
    pub async fn bind(
        config: ScraperConfig,
        plugins: ScrapePlugins,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let addr = config.listen.resolve().await?;
        let listener = TcpListener::bind(addr).await.map_err(|e| ServiceError::Bind {
            addr: config.listen.to_string(),
            reason: e.to_string(),
        })?;

        info!(
            "Scraping server listening on {}, forwarding to {}",
            listener.local_addr()?,
            config.processor
        );

        Ok(Self {
            listener,
            service: Arc::new(ScrapeService::new(config, plugins, metrics)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn jobs(&self) -> Arc<JobTable> {
        Arc::clone(&self.service.jobs)
    }

    /// Serve clients until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let live = self.service.jobs.snapshot();
                    info!("Scraping server shutting down with {:?} live jobs", live);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&self.service);
                        connections.spawn(service.serve(stream));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Client connection task panicked: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Everything one job needs, shared by all client connections.
pub(crate) struct ScrapeService {
    config: ScraperConfig,
    codec: Codec,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    upstream: ProcessingClient,
    jobs: Arc<JobTable>,
    limiter: DomainRateLimiter,
    cache: ResultCache,
    /// Finished responses by job id, for status lookups.
    finished: ResultCache,
    metrics: Arc<Metrics>,
}

impl ScrapeService {
    pub(crate) fn new(config: ScraperConfig, plugins: ScrapePlugins, metrics: Arc<Metrics>) -> Self {
        Self {
            codec: Codec::new(config.max_frame_bytes),
            fetcher: plugins.fetcher,
            extractor: plugins.extractor,
            upstream: ProcessingClient::new(&config, Arc::clone(&metrics)),
            jobs: Arc::new(JobTable::new()),
            limiter: DomainRateLimiter::per_minute(config.rate_limit_per_minute),
            cache: ResultCache::new(config.cache_ttl),
            finished: ResultCache::new(config.result_ttl),
            metrics,
            config,
        }
    }

    async fn serve(self: Arc<Self>, stream: TcpStream) {
        let mut connection = match Connection::new(stream, self.codec, self.config.outbound_buffer) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to set up client connection: {}", e);
                return;
            }
        };
        let peer = connection.peer();
        let sender = connection.sender();
        self.metrics.connection_opened();
        info!("Client connected from {}", peer);

        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                inbound = connection.recv() => match inbound {
                    None => {
                        debug!("Client {} disconnected", peer);
                        break;
                    }
                    Some(Err(e)) => {
                        self.metrics.frame_errors.increment(1);
                        warn!("Dropping client {}: {}", peer, e);
                        break;
                    }
                    Some(Ok(message)) => {
                        deadline = Instant::now() + idle;
                        match message {
                            Message::ScrapeRequest(request) if request.detach => {
                                let (job, registration) = self.admit(request);
                                let accepted = Message::StatusResponse(StatusResponse {
                                    job_id: job.id.clone(),
                                    request_id: job.request_id.clone(),
                                    state: Some(job.state()),
                                    result: None,
                                });
                                let _ = sender.send(&accepted).await;
                                // Detached jobs outlive the connection regardless of policy.
                                let service = Arc::clone(&self);
                                tokio::spawn(async move { service.run(job, registration).await });
                            }
                            Message::ScrapeRequest(request) => {
                                let service = Arc::clone(&self);
                                let sender = sender.clone();
                                jobs.spawn(async move { service.answer(request, sender).await });
                            }
                            Message::StatusRequest(query) => {
                                let _ = sender.send(&Message::StatusResponse(self.status(query))).await;
                            }
                            Message::Heartbeat(heartbeat) => {
                                if let Some(ack) = heartbeat.reply() {
                                    let _ = sender.send(&Message::Heartbeat(ack)).await;
                                }
                            }
                            other => {
                                warn!("Client {} sent unexpected {}", peer, other.name());
                                let reply = Message::ErrorReply(ErrorReply {
                                    job_id: None,
                                    request_id: None,
                                    error: ErrorDescriptor::BadRequest {
                                        message: format!("{} is not a client request", other.name()),
                                    },
                                });
                                let _ = sender.send(&reply).await;
                            }
                        }
                    }
                },
                _ = sleep_until(deadline) => {
                    if !jobs.is_empty() {
                        deadline = Instant::now() + idle;
                        continue;
                    }
                    info!("Closing idle client connection {}", peer);
                    break;
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Job task for {} panicked: {}", peer, e);
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();
        if jobs.is_empty() {
            return;
        }
        match self.config.on_disconnect {
            DisconnectPolicy::Cancel => {
                info!("Cancelling {} in-flight jobs of {}", jobs.len(), peer);
                jobs.abort_all();
            }
            DisconnectPolicy::Continue => {
                debug!("Letting {} jobs of {} finish", jobs.len(), peer);
                tokio::spawn(async move { while jobs.join_next().await.is_some() {} });
            }
        }
    }

    async fn answer(&self, request: ScrapeRequest, sender: FrameSender) {
        let response = self.run_job(request).await;
        let job_id = response.job_id.clone();

        let sent = match encode_response(&self.codec, response) {
            Ok(frame) => sender.send_frame(frame).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            debug!("Job {} response not delivered: {}", job_id, e);
        }
    }

    /// Current state of a job, and its result once finished and still retained.
    pub(crate) fn status(&self, query: StatusRequest) -> StatusResponse {
        let (state, result) = match self.finished.get(query.job_id.as_str()) {
            Some(response) => {
                let state = if response.status == ScrapeStatus::Failed {
                    JobState::Failed
                } else {
                    JobState::Done
                };
                (Some(state), query.include_result.then_some(response))
            }
            None => (self.jobs.state_of(&query.job_id), None),
        };
        StatusResponse {
            job_id: query.job_id,
            request_id: query.request_id,
            state,
            result,
        }
    }

    /// Create and register a job so it is visible to status lookups at once.
    fn admit(&self, request: ScrapeRequest) -> (Job, JobRegistration) {
        let job = Job::new(request.url, request.request_id);
        let registration = self.jobs.register(&job);
        (job, registration)
    }

    pub(crate) async fn run_job(&self, request: ScrapeRequest) -> ScrapeResponse {
        let (job, registration) = self.admit(request);
        self.run(job, registration).await
    }

    /// Run one job to its terminal state. Always produces a response.
    async fn run(&self, mut job: Job, registration: JobRegistration) -> ScrapeResponse {
        let started = std::time::Instant::now();
        self.metrics.record_job_started();
        info!("Job {} started for {}", job.id, job.url);

        let mut response = self.execute(&mut job, &registration).await;
        response.elapsed_ms = started.elapsed().as_millis() as u64;

        let terminal = if response.status == ScrapeStatus::Failed {
            JobState::Failed
        } else {
            JobState::Done
        };
        if !job.state().is_terminal() {
            step(&mut job, &registration, terminal);
        }

        self.finished.insert(job.id.as_str(), &response);
        self.metrics.record_job(response.status, started.elapsed());
        info!(
            "Job {} finished {} in {} ({} live jobs)",
            job.id,
            response.status,
            format_duration(started.elapsed()),
            self.jobs.len().saturating_sub(1)
        );
        response
    }

    async fn execute(&self, job: &mut Job, registration: &JobRegistration) -> ScrapeResponse {
        let failed = |job: &Job, error: ErrorDescriptor| {
            ScrapeResponse::failed(job.id.clone(), job.request_id.clone(), job.url.clone(), error)
        };

        if let Err(e) = validate_url(&job.url) {
            warn!("Job {} rejected: {}", job.id, e);
            step(job, registration, JobState::Failed);
            return failed(job, ErrorDescriptor::Fetch(e));
        }

        if self.limiter.is_enabled() {
            let domain = extract_domain(&job.url).unwrap_or_default();
            if !self.limiter.acquire(&domain).await {
                self.metrics.rate_limited.increment(1);
                warn!(
                    "Job {} rate limited for {} ({} requests in window)",
                    job.id,
                    domain,
                    self.limiter.get_current_rate(&domain).await
                );
                step(job, registration, JobState::Failed);
                return failed(job, ErrorDescriptor::RateLimited { domain });
            }
        }

        step(job, registration, JobState::Fetching);
        if let Some(mut cached) = self.cache.get(&job.url) {
            self.metrics.cache_hits.increment(1);
            debug!("Job {} served from cache", job.id);
            step(job, registration, JobState::Aggregating);
            cached.job_id = job.id.clone();
            cached.request_id = job.request_id.clone();
            return cached;
        }

        let page = match self.fetcher.fetch(&job.url, self.config.fetch_timeout).await {
            Ok(page) => Arc::new(page),
            Err(e) => {
                self.metrics.fetch_failures.increment(1);
                warn!("Job {} fetch failed: {}", job.id, e);
                step(job, registration, JobState::Failed);
                return failed(job, ErrorDescriptor::Fetch(e));
            }
        };

        let extraction = {
            let extractor = Arc::clone(&self.extractor);
            let page = Arc::clone(&page);
            tokio::task::spawn_blocking(move || extractor.extract(&page))
        };

        let kinds = self.config.analyses.clone();
        let analyses = if kinds.is_empty() {
            None
        } else {
            step(job, registration, JobState::Forwarded);
            let request = AnalysisRequest {
                job_id: job.id.clone(),
                page_data: Arc::clone(&page),
                requested_analyses: kinds.clone(),
            };
            Some(self.upstream.analyze(&request, self.config.forward_timeout).await)
        };
        step(job, registration, JobState::Aggregating);

        let mut response = ScrapeResponse::new(job.id.clone(), job.request_id.clone(), job.url.clone());
        response.metadata = Some(extraction.await.unwrap_or_else(|e| {
            error!("Metadata extraction for job {} panicked: {}", job.id, e);
            Metadata::default()
        }));

        match analyses {
            None => {}
            Some(Ok(mut results)) => {
                for kind in kinds {
                    let outcome = results.remove(&kind).unwrap_or(Err(AnalysisError::Missing));
                    response.apply(kind, outcome);
                }
            }
            Some(Err(error)) => {
                warn!("Job {} continues with local results only: {}", job.id, error);
                for kind in kinds {
                    response.apply(kind, Err(error.clone()));
                }
            }
        }

        response.settle();
        if response.status == ScrapeStatus::Ok {
            self.cache.insert(&job.url, &response);
        }
        response
    }
}

fn step(job: &mut Job, registration: &JobRegistration, next: JobState) {
    if let Err(e) = registration.advance(job, next) {
        error!("Job {}: {}", job.id, e);
    }
}

/// Encode a response for its client. One too large to frame loses its
/// analysis payloads first, then everything but a FAILED status.
fn encode_response(codec: &Codec, response: ScrapeResponse) -> Result<Vec<u8>, FramingError> {
    let mut message = Message::ScrapeResponse(response);
    let error = match codec.encode(&message) {
        Ok(frame) => return Ok(frame),
        Err(e) => e,
    };
    if let Message::ScrapeResponse(response) = &mut message {
        warn!("Response for job {} cannot be framed: {}", response.job_id, error);
        strip_payloads(response, &format!("result could not be sent: {error}"));
    }

    let error = match codec.encode(&message) {
        Ok(frame) => return Ok(frame),
        Err(e) => e,
    };
    if let Message::ScrapeResponse(response) = &mut message {
        warn!("Job {} answered without results: {}", response.job_id, error);
        *response = ScrapeResponse::failed(
            response.job_id.clone(),
            response.request_id.clone(),
            response.url.clone(),
            ErrorDescriptor::Unavailable {
                reason: format!("result could not be sent: {error}"),
            },
        );
    }
    codec.encode(&message)
}

/// Replace every successful analysis payload with an error, keeping metadata.
fn strip_payloads(response: &mut ScrapeResponse, reason: &str) {
    let delivered: Vec<AnalysisKind> = [
        (AnalysisKind::Screenshot, matches!(response.screenshot, Some(Ok(_)))),
        (AnalysisKind::Performance, matches!(response.performance, Some(Ok(_)))),
        (AnalysisKind::Image, matches!(response.image_analysis, Some(Ok(_)))),
        (AnalysisKind::Seo, matches!(response.seo, Some(Ok(_)))),
        (AnalysisKind::TechStack, matches!(response.tech_stack, Some(Ok(_)))),
        (AnalysisKind::StructuredData, matches!(response.structured_data, Some(Ok(_)))),
        (AnalysisKind::Accessibility, matches!(response.accessibility, Some(Ok(_)))),
    ]
    .into_iter()
    .filter_map(|(kind, ok)| ok.then_some(kind))
    .collect();

    for kind in delivered {
        response.apply(kind, Err(AnalysisError::failed(reason)));
    }
    response.settle();
}
