//! Connection to the coordinator's engine API

use crate::client::error::{ConnectionError, RequestError};
use crate::engine::messages::{
    CompleteTaskRequest, ErrorResponse, ExecutionResult, HealthResponse, PollTaskRequest,
    ResultQuery, ScheduleActivityRequest, ScheduleActivityResponse, StartWorkflowRequest,
    StartWorkflowResponse, Task,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Retry and timeout settings for [`Connection::dial_with`]
#[derive(Clone, Debug)]
pub struct DialOptions {
    /// Number of health checks attempted before giving up
    pub attempts: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub backoff: Duration,
    /// Timeout for short requests; long polls add their wait on top
    pub request_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// A live, cheaply cloneable connection to the coordinator
#[derive(Clone, Debug)]
pub struct Connection {
    identity: String,
    host_port: String,
    base_url: String,
    cluster_id: Uuid,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl Connection {
    /// Dial the coordinator at `host_port` (`ip:port`) with default options
    pub async fn dial(identity: &str, host_port: &str) -> Result<Self, ConnectionError> {
        Self::dial_with(identity, host_port, &DialOptions::default()).await
    }

    /// Dial the coordinator, retrying failed health checks
    pub async fn dial_with(
        identity: &str,
        host_port: &str,
        options: &DialOptions,
    ) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.request_timeout)
            .build()
            .map_err(|e| ConnectionError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        let base_url = format!("http://{}", host_port);
        let attempts = options.attempts.max(1);

        let mut reason = String::new();
        for attempt in 1..=attempts {
            let health = http
                .get(format!("{}/health", base_url))
                .timeout(options.request_timeout)
                .send()
                .await;
            match health {
                Ok(response) => match decode::<HealthResponse>(response).await {
                    Ok(health) => {
                        return Ok(Self {
                            identity: identity.to_string(),
                            host_port: host_port.to_string(),
                            base_url,
                            cluster_id: health.cluster_id,
                            request_timeout: options.request_timeout,
                            http,
                        })
                    }
                    Err(e) => reason = e.to_string(),
                },
                Err(e) => reason = e.to_string(),
            }

            if attempt < attempts {
                tokio::time::sleep(options.backoff * attempt).await;
            }
        }

        Err(ConnectionError::Unreachable {
            host_port: host_port.to_string(),
            attempts,
            reason,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Cluster the coordinator reported when dialed
    pub fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    pub async fn start_workflow(
        &self,
        req: &StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse, RequestError> {
        self.post("/workflows", req, Duration::ZERO).await
    }

    pub async fn workflow_result(
        &self,
        query: &ResultQuery,
    ) -> Result<ExecutionResult, RequestError> {
        self.get("/workflows/result", query, wait_of(query)).await
    }

    pub async fn schedule_activity(
        &self,
        req: &ScheduleActivityRequest,
    ) -> Result<ScheduleActivityResponse, RequestError> {
        self.post("/activities", req, Duration::ZERO).await
    }

    pub async fn activity_result(
        &self,
        query: &ResultQuery,
    ) -> Result<ExecutionResult, RequestError> {
        self.get("/activities/result", query, wait_of(query)).await
    }

    pub async fn poll_task(&self, req: &PollTaskRequest) -> Result<Option<Task>, RequestError> {
        self.post("/tasks/poll", req, Duration::from_millis(req.wait_ms))
            .await
    }

    pub async fn complete_task(&self, req: &CompleteTaskRequest) -> Result<(), RequestError> {
        let response = self
            .http
            .post(format!("{}/tasks/complete", self.base_url))
            .json(req)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from(response).await)
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B, wait: Duration) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .timeout(self.request_timeout.saturating_add(wait))
            .send()
            .await?;
        decode(response).await
    }

    async fn get<Q, T>(&self, path: &str, query: &Q, wait: Duration) -> Result<T, RequestError>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .timeout(self.request_timeout.saturating_add(wait))
            .send()
            .await?;
        decode(response).await
    }
}

fn wait_of(query: &ResultQuery) -> Duration {
    Duration::from_millis(query.wait_ms.unwrap_or(0))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RequestError> {
    if response.status().is_success() {
        Ok(response.json::<T>().await?)
    } else {
        Err(error_from(response).await)
    }
}

async fn error_from(response: reqwest::Response) -> RequestError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => RequestError::Engine(err),
        Err(_) => RequestError::Protocol(format!("status {}: {}", status, body)),
    }
}

/// A connection slot written once and shared by every client.
///
/// The first caller of [`get_or_dial`](Self::get_or_dial) dials and publishes
/// the connection; concurrent callers wait for that dial instead of racing
/// it. Readers that arrive before publication see `None`.
#[derive(Clone, Debug, Default)]
pub struct SharedConnection {
    cell: Arc<OnceCell<Connection>>,
}

impl SharedConnection {
    /// An empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that already holds `connection`
    pub fn connected(connection: Connection) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(connection))),
        }
    }

    /// The published connection, if any
    pub fn get(&self) -> Option<Connection> {
        self.cell.get().cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.cell.initialized()
    }

    /// Return the published connection, dialing it first if the slot is empty.
    ///
    /// A failed dial leaves the slot empty so a later call can retry.
    pub async fn get_or_dial(
        &self,
        identity: &str,
        host_port: &str,
        options: &DialOptions,
    ) -> Result<Connection, ConnectionError> {
        self.cell
            .get_or_try_init(|| Connection::dial_with(identity, host_port, options))
            .await
            .cloned()
    }
}
