use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::{header, Client, Method};
use serde_json::{json, Value};

use super::{check_response, wrong_kind, NotificationSender, SenderError};
use crate::notify::channel::ChannelConfig;
use crate::notify::TransitionEvent;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Z_]+)\s*\}\}").expect("valid placeholder pattern")
});

/// A sender for pushing notifications via a custom webhook.
pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn default_body(event: &TransitionEvent) -> Value {
    json!({
        "target": event.target_name,
        "type": event.target_kind.as_str(),
        "endpoint": event.target_endpoint,
        "status": event.status.as_str(),
        "timestamp": event.timestamp.to_rfc3339(),
        "latency": event.latency_ms,
        "message": event.message,
    })
}

/// Fills `{{TARGET}}`-style placeholders. Values are escaped for use inside a
/// JSON string; unknown placeholders are left untouched. A result that is not
/// JSON is wrapped as `{"text": ...}`.
pub fn render_template(template: &str, event: &TransitionEvent) -> Value {
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let value = match &caps[1] {
            "TARGET" => event.target_name.clone(),
            "TYPE" => event.target_kind.as_str().to_string(),
            "ENDPOINT" => event.target_endpoint.clone(),
            "STATUS" => event.status.as_str().to_string(),
            "TIME" => event.timestamp.to_rfc3339(),
            "MESSAGE" => event.message.clone().unwrap_or_default(),
            "LATENCY" => event.latency_ms.map(|l| l.to_string()).unwrap_or_default(),
            _ => return caps[0].to_string(),
        };
        escape_json_str(&value)
    });

    match serde_json::from_str::<Value>(&rendered) {
        Ok(v) => v,
        Err(_) => json!({ "text": rendered }), // Fallback
    }
}

fn escape_json_str(value: &str) -> String {
    let quoted = Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, config: &ChannelConfig, event: &TransitionEvent) -> Result<(), SenderError> {
        let ChannelConfig::Webhook(webhook) = config else {
            return Err(wrong_kind("webhook", config));
        };

        let method = Method::from_bytes(webhook.method.to_uppercase().as_bytes()).map_err(|_| {
            SenderError::InvalidConfiguration(format!("Unsupported HTTP method: {}", webhook.method))
        })?;

        let mut headers = header::HeaderMap::new();
        for (key, value) in &webhook.headers {
            let name = header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header name: {}", e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut request = self.client.request(method.clone(), &webhook.url).headers(headers);
        if method != Method::GET && method != Method::HEAD {
            let body = match &webhook.template {
                Some(template) => render_template(template, event),
                None => default_body(event),
            };
            request = request.json(&body);
        }

        tracing::debug!("Sending webhook to {}", webhook.url);
        let response = request.send().await?;
        check_response("Webhook", response).await
    }
}
