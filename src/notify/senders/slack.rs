use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{check_response, wrong_kind, NotificationSender, SenderError};
use crate::model::Status;
use crate::notify::channel::ChannelConfig;
use crate::notify::TransitionEvent;

/// Chat webhook in the Slack incoming-webhook format.
pub struct SlackSender {
    client: Client,
}

impl SlackSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn build_message(event: &TransitionEvent) -> Value {
    let (color, emoji) = match event.status {
        Status::Down => ("danger", ":warning:"),
        Status::Up => ("good", ":white_check_mark:"),
    };

    let mut fields = vec![
        json!({ "title": "Target", "value": event.target_name, "short": true }),
        json!({ "title": "Type", "value": event.target_kind.as_str(), "short": true }),
        json!({ "title": "Endpoint", "value": event.target_endpoint, "short": false }),
        json!({ "title": "Status", "value": event.status.as_str(), "short": true }),
    ];
    if let Some(latency) = event.latency_ms {
        fields.push(json!({ "title": "Latency", "value": format!("{}ms", latency), "short": true }));
    }
    if let Some(message) = &event.message {
        fields.push(json!({ "title": "Message", "value": message, "short": false }));
    }

    json!({
        "text": format!("{} {} is {}", emoji, event.target_name, event.status.as_str()),
        "attachments": [{
            "color": color,
            "fields": fields,
            "footer": "upwatch",
            "ts": event.timestamp.timestamp(),
        }],
    })
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, config: &ChannelConfig, event: &TransitionEvent) -> Result<(), SenderError> {
        let ChannelConfig::Slack(slack) = config else {
            return Err(wrong_kind("slack", config));
        };
        let response = self
            .client
            .post(&slack.webhook_url)
            .json(&build_message(event))
            .send()
            .await?;
        check_response("Slack webhook", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckKind;

    #[test]
    fn attachment_color_follows_status() {
        let mut event = TransitionEvent {
            target_name: "db".into(),
            target_kind: CheckKind::Tcp,
            target_endpoint: "db:5432".into(),
            status: Status::Down,
            message: Some("timeout".into()),
            latency_ms: None,
            timestamp: chrono::Utc::now(),
        };
        let down = build_message(&event);
        assert_eq!(down["text"], ":warning: db is DOWN");
        assert_eq!(down["attachments"][0]["color"], "danger");
        assert_eq!(down["attachments"][0]["fields"].as_array().unwrap().len(), 5);

        event.status = Status::Up;
        event.message = None;
        event.latency_ms = Some(12);
        let up = build_message(&event);
        assert_eq!(up["attachments"][0]["color"], "good");
        assert_eq!(up["attachments"][0]["fields"][4]["value"], "12ms");
    }
}
