use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{check_response, wrong_kind, NotificationSender, SenderError};
use crate::model::Status;
use crate::notify::channel::ChannelConfig;
use crate::notify::TransitionEvent;

/// Incident pager speaking the PagerDuty Events API v2.
pub struct PagerDutySender {
    client: Client,
    events_url: String,
}

impl PagerDutySender {
    pub fn new(client: Client, events_url: impl Into<String>) -> Self {
        Self {
            client,
            events_url: events_url.into(),
        }
    }
}

/// Stable per target, so a trigger and its resolve land on the same incident.
pub fn dedup_key(target_name: &str) -> String {
    format!("upwatch-{}", target_name)
}

pub fn build_event(routing_key: &str, event: &TransitionEvent) -> Value {
    let (action, severity) = match event.status {
        Status::Down => ("trigger", "error"),
        Status::Up => ("resolve", "info"),
    };

    json!({
        "routing_key": routing_key,
        "event_action": action,
        "dedup_key": dedup_key(&event.target_name),
        "payload": {
            "summary": format!("{} is {}", event.target_name, event.status.as_str()),
            "severity": severity,
            "source": event.target_endpoint,
            "timestamp": event.timestamp.to_rfc3339(),
            "custom_details": {
                "type": event.target_kind.as_str(),
                "endpoint": event.target_endpoint,
                "latency": event.latency_ms,
                "message": event.message,
            },
        },
    })
}

#[async_trait]
impl NotificationSender for PagerDutySender {
    async fn send(&self, config: &ChannelConfig, event: &TransitionEvent) -> Result<(), SenderError> {
        let ChannelConfig::PagerDuty(pd) = config else {
            return Err(wrong_kind("pagerduty", config));
        };
        let response = self
            .client
            .post(&self.events_url)
            .json(&build_event(&pd.routing_key, event))
            .send()
            .await?;
        check_response("PagerDuty", response).await
    }
}
