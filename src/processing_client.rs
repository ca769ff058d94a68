//! The scraping server's side of the link to the processing tier.

use crate::codec::Codec;
use crate::config::{Endpoint, ScraperConfig};
use crate::connection::{Connection, FrameSender};
use crate::error::{AnalysisError, CircuitBreaker, ErrorDescriptor, ServiceError};
use crate::heartbeat::PeerMonitor;
use crate::metrics::Metrics;
use crate::protocol::{AnalysisKind, AnalysisOutcome, AnalysisRequest, JobId, Message};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const LINK_LOST: &str = "connection to processing server lost";

enum UpstreamReply {
    Results(BTreeMap<AnalysisKind, AnalysisOutcome>),
    Rejected(ErrorDescriptor),
    Lost(String),
}

type PendingTable = DashMap<JobId, oneshot::Sender<UpstreamReply>>;

/// Multiplexes analysis requests of many jobs over one upstream connection.
///
/// The connection is opened on first use and reopened by the first job that
/// finds it dead. A job never retries on its own.
pub struct ProcessingClient {
    endpoint: Endpoint,
    codec: Codec,
    outbound_buffer: usize,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    link: Mutex<Option<Arc<UpstreamLink>>>,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
}

impl ProcessingClient {
    pub fn new(config: &ScraperConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            endpoint: config.processor.clone(),
            codec: Codec::new(config.max_frame_bytes),
            outbound_buffer: config.outbound_buffer,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            link: Mutex::new(None),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_recovery),
            metrics,
        }
    }

    /// Forward one request and wait for its results.
    ///
    /// An `Err` applies to every requested kind: the processing tier was
    /// unreachable, refused the request, or missed `deadline`.
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        deadline: Duration,
    ) -> Result<BTreeMap<AnalysisKind, AnalysisOutcome>, AnalysisError> {
        let started = Instant::now();
        let link = timeout(deadline, self.link())
            .await
            .map_err(|_| AnalysisError::timeout(deadline))??;

        let (tx, rx) = oneshot::channel();
        let _pending = link.register(request.job_id.clone(), tx)?;

        let message = Message::AnalysisRequest(request.clone());
        timeout(deadline.saturating_sub(started.elapsed()), link.sender.send(&message))
            .await
            .map_err(|_| {
                warn!("Job {} could not be queued upstream within {:?}", request.job_id, deadline);
                AnalysisError::timeout(deadline)
            })?
            .map_err(|e| match e {
                ServiceError::Framing(e) => AnalysisError::failed(format!("page cannot be forwarded: {e}")),
                _ => AnalysisError::unavailable(LINK_LOST),
            })?;
        debug!("Job {} forwarded", request.job_id);

        match timeout(deadline.saturating_sub(started.elapsed()), rx).await {
            Err(_) => {
                warn!("Job {} got no analysis within {:?}", request.job_id, deadline);
                Err(AnalysisError::timeout(deadline))
            }
            Ok(Err(_)) => Err(AnalysisError::unavailable(LINK_LOST)),
            Ok(Ok(UpstreamReply::Results(results))) => Ok(results),
            Ok(Ok(UpstreamReply::Rejected(ErrorDescriptor::Overloaded))) => Err(AnalysisError::Overloaded),
            Ok(Ok(UpstreamReply::Rejected(ErrorDescriptor::Unavailable { reason }))) => {
                Err(AnalysisError::unavailable(reason))
            }
            Ok(Ok(UpstreamReply::Rejected(error))) => Err(AnalysisError::failed(error)),
            Ok(Ok(UpstreamReply::Lost(reason))) => Err(AnalysisError::unavailable(reason)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.is_alive())
            .unwrap_or(false)
    }

    /// Jobs currently waiting on the upstream link.
    pub async fn pending_jobs(&self) -> usize {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.pending.len())
            .unwrap_or(0)
    }

    async fn link(&self) -> Result<Arc<UpstreamLink>, AnalysisError> {
        let mut current = self.link.lock().await;
        if let Some(link) = current.as_ref() {
            if link.is_alive() {
                return Ok(Arc::clone(link));
            }
        }
        *current = None;

        if !self.breaker.can_execute() {
            return Err(AnalysisError::unavailable(format!(
                "processing server {} unreachable, reconnect paused",
                self.endpoint
            )));
        }

        let connection = match self.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.breaker.record_failure();
                warn!(
                    "Cannot reach processing server {} ({} consecutive failures): {}",
                    self.endpoint,
                    self.breaker.get_failure_count(),
                    e
                );
                return Err(AnalysisError::unavailable(e));
            }
        };
        self.breaker.record_success();
        self.metrics.upstream_reconnects.increment(1);
        info!("Connected to processing server at {}", connection.peer());

        let monitor = PeerMonitor::new(self.heartbeat_interval, self.heartbeat_timeout);
        let link = UpstreamLink::start(connection, monitor, Arc::clone(&self.metrics));
        *current = Some(Arc::clone(&link));
        Ok(link)
    }

    async fn connect(&self) -> Result<Connection, String> {
        let addr = self.endpoint.resolve().await.map_err(|e| e.to_string())?;
        timeout(
            self.connect_timeout,
            Connection::connect(addr, self.codec, self.outbound_buffer),
        )
        .await
        .map_err(|_| format!("connect to {} timed out", self.endpoint))?
        .map_err(|e| format!("cannot connect to {}: {}", self.endpoint, e))
    }
}

struct UpstreamLink {
    sender: FrameSender,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl UpstreamLink {
    fn start(connection: Connection, monitor: PeerMonitor, metrics: Arc<Metrics>) -> Arc<Self> {
        let sender = connection.sender();
        let pending = Arc::new(PendingTable::new());
        let alive = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(drive(
            connection,
            monitor,
            Arc::clone(&pending),
            Arc::clone(&alive),
            metrics,
        ));
        Arc::new(Self {
            sender,
            pending,
            alive,
            driver,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.driver.is_finished()
    }

    /// Insert before sending, so a fast reply always finds its entry.
    fn register(
        &self,
        job_id: JobId,
        reply: oneshot::Sender<UpstreamReply>,
    ) -> Result<PendingGuard, AnalysisError> {
        self.pending.insert(job_id.clone(), reply);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            job_id,
        };
        // The driver may have drained the table just before our insert.
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AnalysisError::unavailable(LINK_LOST));
        }
        Ok(guard)
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct PendingGuard {
    pending: Arc<PendingTable>,
    job_id: JobId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.job_id);
    }
}

async fn drive(
    mut connection: Connection,
    monitor: PeerMonitor,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
) {
    let peer = connection.peer().to_string();
    let sender = connection.sender();
    let mut ticker = tokio::time::interval(monitor.interval());
    ticker.tick().await;
    monitor.observe();
    let mut stalled_since: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            inbound = connection.recv() => match inbound {
                None => break "processing server closed the connection".to_string(),
                Some(Err(e)) => {
                    metrics.frame_errors.increment(1);
                    break format!("framing error: {e}");
                }
                Some(Ok(message)) => {
                    monitor.observe();
                    route(message, &pending, &sender, &monitor, &metrics);
                }
            },
            _ = ticker.tick() => {
                if monitor.check(&peer) {
                    break "heartbeat timeout".to_string();
                }
                match sender.try_send(&Message::Heartbeat(monitor.next_request())) {
                    Ok(()) => stalled_since = None,
                    Err(ServiceError::Backpressure) => {
                        let since = *stalled_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= monitor.timeout() {
                            break "processing server stopped reading".to_string();
                        }
                        debug!("Outbound queue to {} full, heartbeat skipped", peer);
                    }
                    Err(_) => break "writer closed".to_string(),
                }
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    connection.abort();
    warn!("Link to processing server {} lost: {}", peer, reason);

    let waiting: Vec<JobId> = pending.iter().map(|entry| entry.key().clone()).collect();
    if !waiting.is_empty() {
        warn!("Resolving {} waiting jobs as unavailable", waiting.len());
    }
    for job_id in waiting {
        if let Some((_, reply)) = pending.remove(&job_id) {
            let _ = reply.send(UpstreamReply::Lost(format!("{LINK_LOST}: {reason}")));
        }
    }
}

fn route(
    message: Message,
    pending: &PendingTable,
    sender: &FrameSender,
    monitor: &PeerMonitor,
    metrics: &Metrics,
) {
    match message {
        Message::AnalysisResponse(response) => {
            deliver(pending, metrics, response.job_id, UpstreamReply::Results(response.results))
        }
        Message::ErrorReply(reply) => match reply.job_id {
            Some(job_id) => deliver(pending, metrics, job_id, UpstreamReply::Rejected(reply.error)),
            None => warn!("Processing server rejected a message: {}", reply.error),
        },
        Message::Heartbeat(heartbeat) => {
            if let Some(ack) = monitor.reply_to(&heartbeat) {
                if let Err(e) = sender.try_send(&Message::Heartbeat(ack)) {
                    debug!("Heartbeat ack not sent: {}", e);
                }
            }
        }
        other => warn!("Ignoring unexpected {} from processing server", other.name()),
    }
}

fn deliver(pending: &PendingTable, metrics: &Metrics, job_id: JobId, reply: UpstreamReply) {
    match pending.remove(&job_id) {
        Some((_, waiter)) => {
            if waiter.send(reply).is_err() {
                debug!("Job {} stopped waiting before its reply arrived", job_id);
            }
        }
        None => {
            metrics.unknown_job_ids.increment(1);
            warn!("Discarding reply for unknown job {}", job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PageData;
    use crate::protocol::{AnalysisPayload, AnalysisResponse, ErrorReply, Heartbeat};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tokio::net::TcpListener;

    fn config(port: u16) -> ScraperConfig {
        ScraperConfig {
            processor: Endpoint::new("127.0.0.1", port),
            connect_timeout: Duration::from_secs(2),
            ..ScraperConfig::default()
        }
    }

    fn request(job_id: &str) -> AnalysisRequest {
        request_with_body(job_id, b"<html></html>".to_vec())
    }

    fn request_with_body(job_id: &str, body: Vec<u8>) -> AnalysisRequest {
        AnalysisRequest {
            job_id: JobId::from(job_id),
            page_data: Arc::new(PageData {
                url: "http://example.com".to_string(),
                final_url: "http://example.com/".to_string(),
                status: 200,
                content_type: Some("text/html".to_string()),
                body,
                fetched_at: Utc::now(),
                elapsed_ms: 3,
            }),
            requested_analyses: BTreeSet::from([AnalysisKind::TechStack]),
        }
    }

    async fn fake_processor() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn accept(listener: &TcpListener) -> Connection {
        let (stream, _) = listener.accept().await.unwrap();
        Connection::new(stream, Codec::default(), 8).unwrap()
    }

    async fn next_request(connection: &mut Connection) -> AnalysisRequest {
        loop {
            match connection.recv().await.unwrap().unwrap() {
                Message::AnalysisRequest(request) => return request,
                Message::Heartbeat(_) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_processor_is_unavailable() {
        let (listener, port) = fake_processor().await;
        drop(listener);

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        let err = client.analyze(&request("j1"), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Unavailable { .. }));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_unknown_job_id_is_discarded() {
        let (listener, port) = fake_processor().await;
        let server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            let request = next_request(&mut connection).await;

            let stray = AnalysisResponse {
                job_id: JobId::from("not-pending"),
                results: BTreeMap::from([(AnalysisKind::TechStack, Ok(AnalysisPayload::TechStack(vec!["Vue".to_string()])))]),
            };
            connection.send(&Message::AnalysisResponse(stray)).await.unwrap();

            let real = AnalysisResponse {
                job_id: request.job_id,
                results: BTreeMap::from([(AnalysisKind::TechStack, Ok(AnalysisPayload::TechStack(vec!["React".to_string()])))]),
            };
            connection.send(&Message::AnalysisResponse(real)).await.unwrap();
            connection
        });

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        let results = client.analyze(&request("j2"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            results[&AnalysisKind::TechStack],
            Ok(AnalysisPayload::TechStack(vec!["React".to_string()]))
        );
        assert_eq!(client.pending_jobs().await, 0);
        drop(server);
    }

    #[tokio::test]
    async fn test_overloaded_reply() {
        let (listener, port) = fake_processor().await;
        let _server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            let request = next_request(&mut connection).await;
            let reply = ErrorReply {
                job_id: Some(request.job_id),
                request_id: None,
                error: ErrorDescriptor::Overloaded,
            };
            connection.send(&Message::ErrorReply(reply)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        let err = client.analyze(&request("j3"), Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, AnalysisError::Overloaded);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_link_loss_resolves_waiting_jobs() {
        let (listener, port) = fake_processor().await;
        let _server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            let _ = next_request(&mut connection).await;
            drop(connection);
            // Keep accepting so the next job can reconnect.
            let mut second = accept(&listener).await;
            let request = next_request(&mut second).await;
            let reply = AnalysisResponse {
                job_id: request.job_id,
                results: BTreeMap::new(),
            };
            second.send(&Message::AnalysisResponse(reply)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        let started = Instant::now();
        let err = client.analyze(&request("j4"), Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Unavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));

        let results = client.analyze(&request("j5"), Duration::from_secs(5)).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let (listener, port) = fake_processor().await;
        let _server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            let _ = next_request(&mut connection).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(connection);
        });

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        let err = client.analyze(&request("j6"), Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, AnalysisError::Timeout { after_ms: 200 });
        assert_eq!(client.pending_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_answered_on_link() {
        let (listener, port) = fake_processor().await;
        let (ack_tx, ack_rx) = oneshot::channel();
        let _server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            let request = next_request(&mut connection).await;
            connection.send(&Message::Heartbeat(Heartbeat::request(9))).await.unwrap();
            loop {
                if let Message::Heartbeat(hb) = connection.recv().await.unwrap().unwrap() {
                    if hb.ack {
                        let _ = ack_tx.send(hb);
                        break;
                    }
                }
            }
            let reply = AnalysisResponse {
                job_id: request.job_id,
                results: BTreeMap::new(),
            };
            connection.send(&Message::AnalysisResponse(reply)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ProcessingClient::new(&config(port), Arc::new(Metrics::new()));
        client.analyze(&request("j7"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(ack_rx.await.unwrap(), Heartbeat { seq: 9, ack: true });
    }

    #[tokio::test]
    async fn test_silent_peer_fails_heartbeat() {
        let (listener, port) = fake_processor().await;
        let _server = tokio::spawn(async move {
            let mut connection = accept(&listener).await;
            // Reads everything, answers nothing.
            while let Some(Ok(_)) = connection.recv().await {}
        });

        let client = ProcessingClient::new(
            &ScraperConfig {
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_timeout: Duration::from_millis(400),
                ..config(port)
            },
            Arc::new(Metrics::new()),
        );
        let started = Instant::now();
        let err = client.analyze(&request("j8"), Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Unavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!client.is_connected().await);
        assert_eq!(client.pending_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_non_reading_peer_does_not_hang_jobs() {
        let (listener, port) = fake_processor().await;
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = Arc::new(ProcessingClient::new(
            &ScraperConfig {
                outbound_buffer: 1,
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_timeout: Duration::from_millis(500),
                ..config(port)
            },
            Arc::new(Metrics::new()),
        ));

        let mut jobs = Vec::new();
        for i in 0..4 {
            let client = Arc::clone(&client);
            jobs.push(tokio::spawn(async move {
                let request = request_with_body(&format!("big-{i}"), vec![b'x'; 8 * 1024 * 1024]);
                tokio::time::timeout(Duration::from_secs(6), client.analyze(&request, Duration::from_secs(1))).await
            }));
        }
        for job in jobs {
            let outcome = job.await.unwrap().expect("job hung past its deadline");
            assert!(matches!(
                outcome,
                Err(AnalysisError::Timeout { .. }) | Err(AnalysisError::Unavailable { .. })
            ));
        }

        tokio::time::timeout(Duration::from_secs(3), async {
            while client.is_connected().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("stalled link still reported as connected");
    }
}
