//! The back-end tier: accepts forwarded pages and runs analyses on them.

use crate::codec::Codec;
use crate::config::ProcessorConfig;
use crate::connection::{Connection, FrameSender};
use crate::error::{AnalysisError, ErrorDescriptor, ServiceError};
use crate::metrics::Metrics;
use crate::plugins::AnalysisPlugins;
use crate::protocol::{AnalysisRequest, AnalysisResponse, ErrorReply, JobId, Message};
use crate::worker::{Admission, AnalysisRunner, WorkerPool};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub struct ProcessingServer {
    listener: TcpListener,
    state: Arc<ProcessingState>,
}

struct ProcessingState {
    config: ProcessorConfig,
    codec: Codec,
    pool: Arc<WorkerPool>,
    runner: AnalysisRunner,
    metrics: Arc<Metrics>,
}

impl ProcessingServer {
    pub async fn bind(
        config: ProcessorConfig,
        plugins: AnalysisPlugins,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let addr = config.listen.resolve().await?;
        let listener = TcpListener::bind(addr).await.map_err(|e| ServiceError::Bind {
            addr: config.listen.to_string(),
            reason: e.to_string(),
        })?;

        info!(
            "Processing server listening on {} ({} workers, queue {})",
            listener.local_addr()?,
            config.max_workers,
            config.max_queue
        );

        let state = ProcessingState {
            codec: Codec::new(config.max_frame_bytes),
            pool: Arc::new(WorkerPool::new(config.max_workers, config.max_queue)),
            runner: AnalysisRunner::new(plugins, config.timeouts.clone()),
            metrics,
            config,
        };
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.state.pool)
    }

    /// Serve connections until `shutdown` resolves. Dropping the returned
    /// future also tears down every connection and running job.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Processing server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&self.state);
                        connections.spawn(state.serve(stream));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.state.pool.close();
        // Queued jobs answer before their connections are dropped.
        tokio::task::yield_now().await;
        Ok(())
    }
}

impl ProcessingState {
    async fn serve(self: Arc<Self>, stream: TcpStream) {
        let mut connection = match Connection::new(stream, self.codec, self.config.outbound_buffer) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to set up connection: {}", e);
                return;
            }
        };
        let peer = connection.peer();
        let sender = connection.sender();
        self.metrics.connection_opened();
        info!("Accepted connection from {}", peer);

        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                inbound = connection.recv() => match inbound {
                    None => {
                        info!("{} closed the connection", peer);
                        break;
                    }
                    Some(Err(e)) => {
                        self.metrics.frame_errors.increment(1);
                        warn!("Dropping connection from {}: {}", peer, e);
                        break;
                    }
                    Some(Ok(message)) => {
                        deadline = Instant::now() + idle;
                        self.dispatch(message, &sender, &mut jobs).await;
                    }
                },
                _ = sleep_until(deadline) => {
                    if !jobs.is_empty() {
                        deadline = Instant::now() + idle;
                        continue;
                    }
                    info!("Closing idle connection from {}", peer);
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

        if !jobs.is_empty() {
            debug!("Aborting {} unfinished jobs of {}", jobs.len(), peer);
        }
        jobs.abort_all();
        self.metrics.connection_closed();
    }

    async fn dispatch(self: &Arc<Self>, message: Message, sender: &FrameSender, jobs: &mut JoinSet<()>) {
        match message {
            Message::AnalysisRequest(request) => match self.pool.try_admit() {
                Ok(admission) => {
                    let state = Arc::clone(self);
                    let sender = sender.clone();
                    jobs.spawn(async move { state.process(admission, request, sender).await });
                    self.metrics.record_pool(&self.pool.stats());
                }
                Err(overloaded) => {
                    self.metrics.overload_rejections.increment(1);
                    warn!("Rejecting job {}: {}", request.job_id, overloaded);
                    reply_error(sender, Some(request.job_id), ErrorDescriptor::Overloaded).await;
                }
            },
            Message::Heartbeat(heartbeat) => {
                if let Some(ack) = heartbeat.reply() {
                    if let Err(e) = sender.send(&Message::Heartbeat(ack)).await {
                        debug!("Heartbeat ack not sent: {}", e);
                    }
                }
            }
            other => {
                warn!("Unexpected {} message on processing connection", other.name());
                reply_error(
                    sender,
                    None,
                    ErrorDescriptor::BadRequest {
                        message: format!("{} is not accepted by the processing server", other.name()),
                    },
                )
                .await;
            }
        }
    }

    async fn process(&self, admission: Admission, request: AnalysisRequest, sender: FrameSender) {
        let slot = match admission.acquire_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Job {} not run, pool closed: {}", request.job_id, e);
                let reason = ErrorDescriptor::Unavailable {
                    reason: "processing server shutting down".to_string(),
                };
                reply_error(&sender, Some(request.job_id), reason).await;
                return;
            }
        };
        self.metrics.record_pool(&self.pool.stats());

        let job_id = request.job_id;
        let kinds = request.requested_analyses;
        debug!("Job {} running {} analyses", job_id, kinds.len());

        let outcomes = self.runner.run(request.page_data, &kinds).await;
        drop(slot);
        self.metrics.record_pool(&self.pool.stats());

        let results = outcomes
            .into_iter()
            .map(|(kind, (outcome, elapsed))| {
                self.metrics.record_analysis(outcome.is_ok(), elapsed);
                if let Err(e) = &outcome {
                    debug!("Job {} {} failed: {}", job_id, kind, e);
                }
                (kind, outcome)
            })
            .collect();

        let message = Message::AnalysisResponse(AnalysisResponse {
            job_id: job_id.clone(),
            results,
        });
        match sender.send(&message).await {
            Ok(()) => debug!("Job {} answered", job_id),
            Err(ServiceError::Framing(e)) => {
                // Too big to send; answer with per-kind errors so the job does not wait out its deadline.
                warn!("Job {} result cannot be framed: {}", job_id, e);
                let reason = AnalysisError::failed(format!("result could not be sent: {e}"));
                let fallback = Message::AnalysisResponse(AnalysisResponse {
                    job_id: job_id.clone(),
                    results: kinds.iter().map(|&kind| (kind, Err(reason.clone()))).collect(),
                });
                if let Err(e) = sender.send(&fallback).await {
                    debug!("Job {} fallback not sent: {}", job_id, e);
                }
            }
            Err(e) => debug!("Job {} finished after its connection closed: {}", job_id, e),
        }
    }
}

async fn reply_error(sender: &FrameSender, job_id: Option<JobId>, error: ErrorDescriptor) {
    let reply = Message::ErrorReply(ErrorReply {
        job_id,
        request_id: None,
        error,
    });
    if let Err(e) = sender.send(&reply).await {
        debug!("Error reply not sent: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::protocol::{Heartbeat, ScrapeRequest};
    use tokio::sync::oneshot;

    async fn start() -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), ServiceError>>) {
        let config = ProcessorConfig {
            listen: Endpoint::new("127.0.0.1", 0),
            max_workers: 2,
            max_queue: 2,
            ..ProcessorConfig::default()
        };
        let server = ProcessingServer::bind(config, AnalysisPlugins::placeholder(), Arc::new(Metrics::new()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let (addr, _stop, _handle) = start().await;
        let mut connection = Connection::connect(addr, Codec::default(), 8).await.unwrap();

        connection.send(&Message::Heartbeat(Heartbeat::request(42))).await.unwrap();
        let reply = connection.recv().await.unwrap().unwrap();
        assert_eq!(reply, Message::Heartbeat(Heartbeat { seq: 42, ack: true }));
    }

    #[tokio::test]
    async fn test_unexpected_message_gets_error_reply() {
        let (addr, _stop, _handle) = start().await;
        let mut connection = Connection::connect(addr, Codec::default(), 8).await.unwrap();

        let request = Message::ScrapeRequest(ScrapeRequest {
            url: "http://example.com".to_string(),
            request_id: None,
            detach: false,
        });
        connection.send(&request).await.unwrap();
        match connection.recv().await.unwrap().unwrap() {
            Message::ErrorReply(reply) => {
                assert!(matches!(reply.error, ErrorDescriptor::BadRequest { .. }));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        // The connection stays usable afterwards.
        connection.send(&Message::Heartbeat(Heartbeat::request(1))).await.unwrap();
        assert!(matches!(
            connection.recv().await.unwrap().unwrap(),
            Message::Heartbeat(Heartbeat { seq: 1, ack: true })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (addr, stop, handle) = start().await;
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (addr, _stop, _handle) = start().await;
        let config = ProcessorConfig {
            listen: Endpoint::new("127.0.0.1", addr.port()),
            ..ProcessorConfig::default()
        };
        let err = ProcessingServer::bind(config, AnalysisPlugins::placeholder(), Arc::new(Metrics::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Bind { .. }));
    }
}
