use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::protocol::{JobId, Message, ScrapeRequest, ScrapeResponse, StatusRequest, StatusResponse};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Issues one job per call against a scraping server.
pub struct ScrapeClient {
    config: ClientConfig,
}

impl ScrapeClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Send one `ScrapeRequest` and wait for the matching response.
    ///
    /// A timeout or lost connection is a local failure only; the server may
    /// still finish the job.
    pub async fn scrape(&self, url: &str) -> Result<ScrapeResponse, ClientError> {
        let mut connection = self.open().await?;
        let request_id = new_request_id();
        connection
            .send(&Message::ScrapeRequest(ScrapeRequest {
                url: url.to_string(),
                request_id: Some(request_id.clone()),
                detach: false,
            }))
            .await?;
        info!("Requested analysis of {} from {}", url, connection.peer());

        let deadline = Instant::now() + self.config.timeout;
        self.await_reply(&mut connection, deadline, |message| match message {
            Message::ScrapeResponse(response) if response.request_id.as_deref() == Some(request_id.as_str()) => {
                debug!("Job {} answered", response.job_id);
                Some(response)
            }
            _ => None,
        })
        .await
    }

    /// Start a job without waiting for it. The result is fetched later with
    /// `status` or `wait_for`.
    pub async fn submit(&self, url: &str) -> Result<JobId, ClientError> {
        let mut connection = self.open().await?;
        let request_id = new_request_id();
        connection
            .send(&Message::ScrapeRequest(ScrapeRequest {
                url: url.to_string(),
                request_id: Some(request_id.clone()),
                detach: true,
            }))
            .await?;

        let deadline = Instant::now() + self.config.timeout;
        let job_id = self
            .await_reply(&mut connection, deadline, |message| match message {
                Message::StatusResponse(status) if status.request_id.as_deref() == Some(request_id.as_str()) => {
                    Some(status.job_id)
                }
                _ => None,
            })
            .await?;
        info!("Job {} accepted for {}", job_id, url);
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &JobId, include_result: bool) -> Result<StatusResponse, ClientError> {
        let mut connection = self.open().await?;
        let deadline = Instant::now() + self.config.timeout;
        self.query(&mut connection, job_id, include_result, deadline).await
    }

    /// Poll every `interval` until the job's result is available.
    pub async fn wait_for(&self, job_id: &JobId, interval: Duration) -> Result<ScrapeResponse, ClientError> {
        let mut connection = self.open().await?;
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let status = self.query(&mut connection, job_id, true, deadline).await?;
            match (status.state, status.result) {
                (_, Some(result)) => return Ok(result),
                (None, None) => return Err(ClientError::UnknownJob(job_id.clone())),
                (Some(state), None) => debug!("Job {} is {}", job_id, state),
            }
            if Instant::now() + interval >= deadline {
                return Err(ClientError::Timeout(self.config.timeout));
            }
            sleep(interval).await;
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn open(&self) -> Result<Connection, ClientError> {
        let addr = self.config.server.resolve().await?;
        let codec = Codec::new(self.config.max_frame_bytes);
        timeout(self.config.connect_timeout, Connection::connect(addr, codec, 4))
            .await
            .map_err(|_| ClientError::Connect {
                addr: self.config.server.to_string(),
                reason: format!("timed out after {:?}", self.config.connect_timeout),
            })?
            .map_err(|e| ClientError::Connect {
                addr: self.config.server.to_string(),
                reason: e.to_string(),
            })
    }

    async fn query(
        &self,
        connection: &mut Connection,
        job_id: &JobId,
        include_result: bool,
        deadline: Instant,
    ) -> Result<StatusResponse, ClientError> {
        let request_id = new_request_id();
        connection
            .send(&Message::StatusRequest(StatusRequest {
                job_id: job_id.clone(),
                request_id: Some(request_id.clone()),
                include_result,
            }))
            .await?;
        self.await_reply(connection, deadline, |message| match message {
            Message::StatusResponse(status) if status.request_id.as_deref() == Some(request_id.as_str()) => {
                Some(status)
            }
            _ => None,
        })
        .await
    }

    /// Read until `accept` takes a message, answering heartbeats on the way.
    async fn await_reply<T>(
        &self,
        connection: &mut Connection,
        deadline: Instant,
        mut accept: impl FnMut(Message) -> Option<T>,
    ) -> Result<T, ClientError> {
        loop {
            let inbound = timeout(deadline.saturating_duration_since(Instant::now()), connection.recv())
                .await
                .map_err(|_| ClientError::Timeout(self.config.timeout))?;

            match inbound {
                None => return Err(ClientError::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Heartbeat(heartbeat))) => {
                    if let Some(ack) = heartbeat.reply() {
                        connection.send(&Message::Heartbeat(ack)).await?;
                    }
                }
                Some(Ok(Message::ErrorReply(reply))) => return Err(ClientError::Rejected(reply.error)),
                Some(Ok(message)) => {
                    let name = message.name();
                    if let Some(reply) = accept(message) {
                        return Ok(reply);
                    }
                    warn!("Ignoring {} not meant for this request", name);
                }
            }
        }
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::job::JobState;
    use crate::protocol::{Heartbeat, ScrapeStatus};
    use tokio::net::TcpListener;

    async fn fake_server() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            server: Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port()),
            timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        (listener, config)
    }

    async fn accept_request(listener: &TcpListener) -> (Connection, ScrapeRequest) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut connection = Connection::new(stream, Codec::default(), 4).unwrap();
        match connection.recv().await.unwrap().unwrap() {
            Message::ScrapeRequest(request) => (connection, request),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matching_response_after_heartbeat() {
        let (listener, config) = fake_server().await;
        let server = tokio::spawn(async move {
            let (mut connection, request) = accept_request(&listener).await;
            connection.send(&Message::Heartbeat(Heartbeat::request(1))).await.unwrap();
            let ack = connection.recv().await.unwrap().unwrap();

            let mut stale = ScrapeResponse::new(JobId::from("other"), Some("someone-else".to_string()), &request.url);
            stale.status = ScrapeStatus::Failed;
            connection.send(&Message::ScrapeResponse(stale)).await.unwrap();

            let response = ScrapeResponse::new(JobId::from("mine"), request.request_id, request.url);
            connection.send(&Message::ScrapeResponse(response)).await.unwrap();
            ack
        });

        let response = ScrapeClient::new(config).scrape("http://example.com").await.unwrap();
        assert_eq!(response.job_id, JobId::from("mine"));
        assert_eq!(response.status, ScrapeStatus::Ok);
        assert_eq!(
            server.await.unwrap(),
            Message::Heartbeat(Heartbeat { seq: 1, ack: true })
        );
    }

    #[tokio::test]
    async fn test_timeout_is_local_failure() {
        let (listener, config) = fake_server().await;
        let _server = tokio::spawn(async move {
            let (connection, _) = accept_request(&listener).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(connection);
        });

        let err = ScrapeClient::new(config).scrape("http://example.com").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connection_loss() {
        let (listener, config) = fake_server().await;
        tokio::spawn(async move {
            let (connection, _) = accept_request(&listener).await;
            drop(connection);
        });

        let err = ScrapeClient::new(config).scrape("http://example.com").await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (listener, config) = fake_server().await;
        drop(listener);
        let err = ScrapeClient::new(config).scrape("http://example.com").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_submit_returns_job_id() {
        let (listener, config) = fake_server().await;
        let server = tokio::spawn(async move {
            let (connection, request) = accept_request(&listener).await;
            connection
                .send(&Message::StatusResponse(StatusResponse {
                    job_id: JobId::from("detached"),
                    request_id: request.request_id,
                    state: Some(JobState::Pending),
                    result: None,
                }))
                .await
                .unwrap();
            request.detach
        });

        let job_id = ScrapeClient::new(config).submit("http://example.com").await.unwrap();
        assert_eq!(job_id, JobId::from("detached"));
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_polls_until_result() {
        let (listener, config) = fake_server().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut connection = Connection::new(stream, Codec::default(), 4).unwrap();
            let mut polls = 0;
            while let Some(Ok(Message::StatusRequest(query))) = connection.recv().await {
                polls += 1;
                let result = (polls == 3).then(|| ScrapeResponse::new(query.job_id.clone(), None, "http://example.com"));
                let state = if result.is_some() { JobState::Done } else { JobState::Forwarded };
                connection
                    .send(&Message::StatusResponse(StatusResponse {
                        job_id: query.job_id,
                        request_id: query.request_id,
                        state: Some(state),
                        result,
                    }))
                    .await
                    .unwrap();
            }
        });

        let response = ScrapeClient::new(config)
            .wait_for(&JobId::from("j1"), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(response.job_id, JobId::from("j1"));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let (listener, config) = fake_server().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut connection = Connection::new(stream, Codec::default(), 4).unwrap();
            if let Some(Ok(Message::StatusRequest(query))) = connection.recv().await {
                connection
                    .send(&Message::StatusResponse(StatusResponse {
                        job_id: query.job_id,
                        request_id: query.request_id,
                        state: None,
                        result: None,
                    }))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = ScrapeClient::new(config)
            .wait_for(&JobId::from("gone"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownJob(id) if id == JobId::from("gone")));
    }
}
