//! Registration, heartbeat, command-result reporting, and event upload
//! against the cloud backend (§4.6).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use core_common::model::{Command, Event};

use crate::error::{AgentError, Result};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_PENDING_COMMANDS: usize = 10;
const MAX_EVENTS_PER_BATCH: usize = 50;

#[derive(Serialize)]
struct RegisterRequest<'a> {
    hostname: &'a str,
    local_ip: &'a str,
    os_info: &'a str,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub client_id: String,
    pub user_id: String,
    pub supabase_url: String,
    pub anon_key: String,
}

#[derive(Serialize)]
pub struct HeartbeatRequest<'a> {
    pub client_id: &'a str,
    pub local_ip: &'a str,
    pub hostname: &'a str,
    pub os_info: &'a str,
    pub ffmpeg_installed: bool,
    pub active_streams: Vec<String>,
    pub network_range: Option<&'a str>,
}

#[derive(Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Serialize)]
struct CommandResultRequest<'a> {
    status: &'a str,
    result: Option<&'a serde_json::Value>,
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct EventUploadRequest<'a> {
    events: &'a [Event],
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    device_token: String,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HEARTBEAT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            device_token: device_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn send<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<R> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .header("X-Device-Token", &self.device_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_client_error() || status.is_server_error() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.message)
                .unwrap_or(text);
            return Err(AgentError::Core(core_common::CoreError::NetworkUnreachable(message)));
        }

        if text.trim().is_empty() {
            return serde_json::from_str("null").map_err(|e| AgentError::Xml(e.to_string()));
        }

        serde_json::from_str(&text).map_err(|e| AgentError::Xml(format!("response decode: {e}")))
    }

    /// Required before any other call. Device token is carried by every
    /// subsequent request as a single opaque header; this server-side
    /// response is authoritative — the agent never mints its own token.
    pub async fn register(&self, hostname: &str, local_ip: &str, os_info: &str) -> Result<RegisterResponse> {
        let req = RegisterRequest { hostname, local_ip, os_info };
        self.send(reqwest::Method::POST, "/api/agent/register", Some(&req)).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest<'_>) -> Result<Vec<Command>> {
        let response: HeartbeatResponse = self.send(reqwest::Method::POST, "/api/agent/heartbeat", Some(req)).await?;
        Ok(response.commands.into_iter().take(MAX_PENDING_COMMANDS).collect())
    }

    pub async fn command_result(
        &self,
        command_id: &str,
        status: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let req = CommandResultRequest { status, result, error };
        let path = format!("/api/agent/commands/{command_id}/result");
        let _: serde_json::Value = self.send(reqwest::Method::PATCH, &path, Some(&req)).await?;
        Ok(())
    }

    /// Uploads at most 50 events; callers are responsible for chunking a
    /// larger buffer.
    pub async fn upload_events(&self, events: &[Event]) -> Result<()> {
        if events.len() > MAX_EVENTS_PER_BATCH {
            warn!(count = events.len(), "truncating event batch to 50");
        }
        let batch = &events[..events.len().min(MAX_EVENTS_PER_BATCH)];
        let req = EventUploadRequest { events: batch };
        let _: serde_json::Value = self.send(reqwest::Method::POST, "/api/agent/events", Some(&req)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_caps_at_ten_pending_commands() {
        assert_eq!(MAX_PENDING_COMMANDS, 10);
    }

    #[test]
    fn event_batches_cap_at_fifty() {
        assert_eq!(MAX_EVENTS_PER_BATCH, 50);
    }
}
