use async_trait::async_trait;
use thiserror::Error;

use super::channel::{ChannelConfig, ChannelConfigError};
use super::TransitionEvent;

pub mod email;
pub mod pagerduty;
pub mod slack;
pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Config(#[from] ChannelConfigError),
    #[error("Not delivered: {0}")]
    NotDelivered(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Delivers a transition event through one kind of channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// `config` is the parsed configuration of the channel being delivered to;
    /// a sender rejects configurations of any other kind.
    async fn send(&self, config: &ChannelConfig, event: &TransitionEvent) -> Result<(), SenderError>;
}

/// Turns a non-2xx response into [`SenderError::SendFailed`], keeping the body for the log.
pub(crate) async fn check_response(
    service: &str,
    response: reqwest::Response,
) -> Result<(), SenderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(SenderError::SendFailed(format!(
        "{service} returned non-success status: {status}. Body: {body}"
    )))
}

pub(crate) fn wrong_kind(expected: &str, config: &ChannelConfig) -> SenderError {
    SenderError::InvalidConfiguration(format!(
        "Expected {} config, but found {}.",
        expected,
        config.kind().as_str()
    ))
}
