// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

use core_common::CoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("transcoder process error: {0}")]
    Transcoder(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Maps onto the same error classes the relay and cloud API use, so
    /// logs and event payloads stay consistent across crates.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Core(e) => e.kind(),
            AgentError::Config(_) => "invalid_input",
            AgentError::Http(_) | AgentError::WebSocket(_) => "network_unreachable",
            AgentError::Xml(_) => "protocol_error",
            AgentError::Transcoder(_) => "internal",
            AgentError::Io(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
