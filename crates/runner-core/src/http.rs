use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// How a request path is treated by the retry policy (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    /// `/download`, `/convert`, `/upload` progress ticks: single attempt,
    /// failures are logged and swallowed.
    Progress,
    /// `/start`, `/complete`, `/fail`, `/downloadComplete`: retried, each
    /// retry logged at warn.
    State,
    /// Everything else (`/online`, `/heartbeat`, `/getTask`, `/minio`):
    /// retried silently up to the same backoff schedule.
    Other,
}

fn classify(path: &str) -> CallKind {
    const STATE_SUFFIXES: &[&str] = &["/start", "/complete", "/fail", "/downloadComplete"];
    if STATE_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
        CallKind::State
    } else if path.ends_with("/download") || path.ends_with("/convert") || path.ends_with("/upload")
    {
        CallKind::Progress
    } else {
        CallKind::Other
    }
}

const MAX_RETRIES: u32 = 3;
const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

fn backoff_delay(attempt: u32) -> Duration {
    let exp = INITIAL_DELAY.as_millis() as f64 * 2f64.powi(attempt as i32);
    let capped = exp.min(MAX_DELAY.as_millis() as f64);
    let jitter = capped * 0.1 * rand::random::<f64>();
    Duration::from_millis((capped + jitter) as u64)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Authenticated HTTP client for the control plane: one shared
/// `reqwest::Client`, `Authorization: Bearer <token>` and
/// `Content-Type: application/json` injected on every call, 30 s timeout
/// per attempt.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Sends a request whose body deserializes to `R`, applying the
    /// classify-then-retry policy from spec §4.1.
    pub async fn request<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> anyhow::Result<R> {
        let kind = classify(path);
        let attempts = match kind {
            CallKind::Progress => 1,
            CallKind::State | CallKind::Other => MAX_RETRIES + 1,
        };

        let mut last_err = None;
        for attempt in 0..attempts {
            match self.try_once(method.clone(), path, body).await {
                Ok(value) => return Ok(value),
                Err(RequestFailure::NonRetryable(err)) => return Err(err),
                Err(RequestFailure::Retryable(err)) => {
                    if matches!(kind, CallKind::Progress) {
                        tracing::warn!(path, error = %err, "progress call failed, dropping");
                        return Err(err);
                    }
                    if attempt + 1 < attempts {
                        let delay = backoff_delay(attempt);
                        tracing::warn!(path, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying control-plane call");
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request to {path} failed with no attempts")))
    }

    async fn try_once<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, RequestFailure> {
        let mut req = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(err) => return Err(RequestFailure::Retryable(err.into())),
        };

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(RequestFailure::NonRetryable(anyhow::anyhow!(
                "{path} returned 403 Forbidden"
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RequestFailure::NonRetryable(anyhow::anyhow!(
                "{path} returned 404 Not Found"
            )));
        }
        if is_retryable_status(status) {
            return Err(RequestFailure::Retryable(anyhow::anyhow!(
                "{path} returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(RequestFailure::NonRetryable(anyhow::anyhow!(
                "{path} returned {status}"
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| RequestFailure::NonRetryable(err.into()))
    }
}

enum RequestFailure {
    Retryable(anyhow::Error),
    NonRetryable(anyhow::Error),
}
