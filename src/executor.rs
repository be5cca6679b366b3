//! Sends one request, times it, and classifies what happened.
//!
//! The [`RequestExecutor`] never fails: every call produces exactly one
//! [`ActionResult`], including calls that time out or can't connect.

use http::StatusCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum_macros::EnumIter;
use tokio::time::Instant;
use url::Url;

use crate::session::Credential;
use crate::task::{TaskMethod, TaskRequest};
use crate::HatchlingError;

/// Identifies requests sent by Hatchling.
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// How a request ended.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter,
)]
pub enum Outcome {
    /// A 2xx response.
    Success,
    /// A 4xx response, or any other status that isn't a success or a server error.
    ClientError,
    /// A 5xx response.
    ServerError,
    /// The request timed out, or couldn't be sent or read.
    NetworkFailure,
}
impl Outcome {
    /// Classify a final response status.
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Outcome::Success
        } else if status.is_server_error() {
            Outcome::ServerError
        } else {
            // 4xx, and anything unexpected such as 1xx or a redirect that wasn't followed.
            Outcome::ClientError
        }
    }

    /// Returns true for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        *self == Outcome::Success
    }
}
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::ClientError => "client error",
            Outcome::ServerError => "server error",
            Outcome::NetworkFailure => "network failure",
        };
        write!(f, "{}", name)
    }
}

/// The result of one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// The label of the task (or bootstrap step) that sent the request.
    pub label: String,
    /// The method of the request.
    pub method: TaskMethod,
    /// The path of the request, relative to the host.
    pub path: String,
    /// How the request ended.
    pub outcome: Outcome,
    /// Time from sending the request until the full body was read, or until it failed.
    #[serde(rename = "response_time", with = "milliseconds")]
    pub latency: Duration,
    /// The response status code, if a response was received.
    pub status_code: Option<u16>,
    /// A description of what went wrong, if anything.
    pub error: Option<String>,
}
impl ActionResult {
    /// Build a result from a received response status.
    pub(crate) fn from_status(
        label: &str,
        request: &TaskRequest,
        status: StatusCode,
        latency: Duration,
    ) -> Self {
        let outcome = Outcome::from_status(status);
        let error = if outcome.is_success() {
            None
        } else if status.is_client_error() || status.is_server_error() {
            Some(status.to_string())
        } else {
            Some(format!("unexpected status: {}", status))
        };
        ActionResult {
            label: label.to_string(),
            method: request.method,
            path: request.path.to_string(),
            outcome,
            latency,
            status_code: Some(status.as_u16()),
            error,
        }
    }

    /// Build a result for a request that never completed.
    pub(crate) fn network_failure(
        label: &str,
        request: &TaskRequest,
        latency: Duration,
        error: String,
    ) -> Self {
        ActionResult {
            label: label.to_string(),
            method: request.method,
            path: request.path.to_string(),
            outcome: Outcome::NetworkFailure,
            latency,
            status_code: None,
            error: Some(error),
        }
    }

    /// Latency in whole milliseconds.
    pub fn response_time(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Serialize latencies as integer milliseconds.
mod milliseconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(latency.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Sends task requests to the target host.
///
/// Cloning is cheap, all clones share one connection pool.
#[derive(Clone, Debug)]
pub struct RequestExecutor {
    client: Client,
    base_url: Url,
    timeout: Duration,
}
impl RequestExecutor {
    /// Build an executor with a default [`reqwest::Client`].
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, HatchlingError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .gzip(true)
            .build()?;
        Ok(RequestExecutor::with_client(client, base_url, timeout))
    }

    /// Build an executor around a custom [`reqwest::Client`].
    pub fn with_client(client: Client, base_url: Url, timeout: Duration) -> Self {
        RequestExecutor {
            client,
            base_url,
            timeout,
        }
    }

    /// Send `request`, with a bearer token if a credential is provided.
    pub async fn execute(
        &self,
        label: &str,
        request: &TaskRequest,
        credential: Option<&Credential>,
    ) -> ActionResult {
        self.execute_with_body(label, request, credential).await.0
    }

    /// Send `request`, also returning the response body if one was read.
    pub(crate) async fn execute_with_body(
        &self,
        label: &str,
        request: &TaskRequest,
        credential: Option<&Credential>,
    ) -> (ActionResult, Option<String>) {
        let started = Instant::now();

        let url = match self.base_url.join(&request.path) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}: invalid path {}: {}", label, request.path, e);
                let error = format!("invalid path {}: {}", request.path, e);
                return (
                    ActionResult::network_failure(label, request, started.elapsed(), error),
                    None,
                );
            }
        };

        let mut builder = self.client.request(request.method.into(), url);
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.token());
        }

        // The timeout covers sending the request and reading the entire body.
        let response = tokio::time::timeout(self.timeout, async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;
        let latency = started.elapsed();

        match response {
            Ok(Ok((status, body))) => {
                let result = ActionResult::from_status(label, request, status, latency);
                trace!(
                    "{} {} {}: {} in {:?}",
                    label,
                    request.method,
                    request.path,
                    status,
                    latency
                );
                (result, Some(body))
            }
            Ok(Err(e)) => {
                debug!("{} {} {}: {}", label, request.method, request.path, e);
                (
                    ActionResult::network_failure(label, request, latency, e.to_string()),
                    None,
                )
            }
            Err(_) => {
                debug!(
                    "{} {} {}: timed out after {:?}",
                    label, request.method, request.path, self.timeout
                );
                let error = format!("timed out after {:?}", self.timeout);
                (
                    ActionResult::network_failure(label, request, latency, error),
                    None,
                )
            }
        }
    }
}
