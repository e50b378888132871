//! Assistant-side client for the control plane, used by the `hook`
//! subcommands.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::control::{
    ApprovalRequest, ApprovalResponse, EndRequest, ErrorBody, Health, NotificationRequest,
    ResponseRequest, StartRequest, StartResponse,
};
use crate::error::SinkError;
use crate::models::Verdict;
use crate::sink::take_verdict;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Nothing is listening at the control URL. A relay that accepts the
    /// connection but answers slowly is not unreachable.
    #[error("relay daemon unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("relay rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl HookError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, HookError::Unreachable { .. })
    }
}

pub struct ControlClient {
    base: String,
    http: Client,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self, HookError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, HookError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base_url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn health(&self) -> Result<Health, HookError> {
        let url = self.url("/health");
        let response = self.http.get(&url).send().map_err(|err| self.classify(url, err))?;
        decode(response)
    }

    pub fn start(&self, session_id: &str, project_path: &str) -> Result<StartResponse, HookError> {
        self.post(
            "/session/start",
            &StartRequest {
                session_id: session_id.to_string(),
                project_path: project_path.to_string(),
            },
        )
    }

    /// Returns the response handle the verdict will be written to.
    pub fn request_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        command: &str,
        description: &str,
    ) -> Result<String, HookError> {
        let response: ApprovalResponse = self.post(
            "/request_approval",
            &ApprovalRequest {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                command: command.to_string(),
                description: description.to_string(),
            },
        )?;
        Ok(response.response_file)
    }

    pub fn notify(&self, session_id: &str, message: &str) -> Result<(), HookError> {
        self.post::<_, serde_json::Value>(
            "/notification",
            &NotificationRequest {
                session_id: session_id.to_string(),
                message: message.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn respond(&self, session_id: &str, response: &str) -> Result<(), HookError> {
        self.post::<_, serde_json::Value>(
            "/response",
            &ResponseRequest {
                session_id: session_id.to_string(),
                response: response.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn end(&self, session_id: &str) -> Result<(), HookError> {
        self.post::<_, serde_json::Value>(
            "/session/end",
            &EndRequest {
                session_id: session_id.to_string(),
            },
        )?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, HookError> {
        let url = self.url(path);
        debug!(%url, "control request");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(|err| self.classify(url, err))?;
        decode(response)
    }

    fn classify(&self, url: String, err: reqwest::Error) -> HookError {
        if err.is_connect() {
            HookError::Unreachable { url, source: err }
        } else {
            HookError::Http(err)
        }
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HookError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json()?);
    }
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(HookError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Polls a response file until a verdict appears or `timeout` elapses.
/// The file is consumed when read.
pub fn wait_for_verdict(
    path: &Path,
    timeout: Duration,
    poll: Duration,
) -> Result<Option<Verdict>, HookError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(verdict) = take_verdict(path)? {
            return Ok(Some(verdict));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(poll.min(deadline - now));
    }
}
