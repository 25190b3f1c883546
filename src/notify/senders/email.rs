use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

use super::{check_response, wrong_kind, NotificationSender, SenderError};
use crate::model::Status;
use crate::notify::channel::ChannelConfig;
use crate::notify::TransitionEvent;

/// Outbound mail transport.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_mail(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError>;
}

/// Posts messages to an HTTP mail relay as `{from, to, subject, html}`.
pub struct MailRelay {
    client: Client,
    url: String,
    from: String,
}

impl MailRelay {
    pub fn new(client: Client, url: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            from: from.into(),
        }
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[async_trait]
impl EmailSender for MailRelay {
    async fn send_mail(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError> {
        let message = RelayMessage {
            from: &self.from,
            to,
            subject,
            html,
        };
        let response = self.client.post(&self.url).json(&message).send().await?;
        check_response("Mail relay", response).await?;
        tracing::info!("Alert sent to {}: {}", to, subject);
        Ok(())
    }
}

/// Used when no relay is configured. Every message is refused with
/// [`SenderError::NotDelivered`] so callers never count it as sent.
pub struct NoRelay;

#[async_trait]
impl EmailSender for NoRelay {
    async fn send_mail(&self, to: &str, _subject: &str, _html: &str) -> Result<(), SenderError> {
        Err(SenderError::NotDelivered(format!("no mail relay configured, email to {} dropped", to)))
    }
}

pub fn subject(event: &TransitionEvent) -> String {
    match event.status {
        Status::Down => format!("⚠️ {} is DOWN", event.target_name),
        Status::Up => format!("✅ {} has recovered", event.target_name),
    }
}

pub fn render_html(event: &TransitionEvent) -> String {
    let (heading, color) = match event.status {
        Status::Down => ("Alert", "#dc2626"),
        Status::Up => ("Recovery", "#16a34a"),
    };

    let mut html = format!(
        "<h2 style=\"color:{}\">{}: {}</h2>\n\
         <p><strong>Type:</strong> {}</p>\n\
         <p><strong>Endpoint:</strong> {}</p>\n\
         <p><strong>Status:</strong> <span style=\"color:{}\">{}</span></p>\n\
         <p><strong>Time:</strong> {}</p>",
        color,
        heading,
        escape_html(&event.target_name),
        event.target_kind.as_str(),
        escape_html(&event.target_endpoint),
        color,
        event.status.as_str(),
        event.timestamp.to_rfc3339(),
    );
    if let Some(message) = &event.message {
        html.push_str(&format!("\n<p><strong>Message:</strong> {}</p>", escape_html(message)));
    }
    if let Some(latency) = event.latency_ms {
        html.push_str(&format!("\n<p><strong>Latency:</strong> {}ms</p>", latency));
    }
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Email channel: renders the event and hands it to the mail transport.
pub struct EmailChannelSender {
    mailer: Arc<dyn EmailSender>,
}

impl EmailChannelSender {
    pub fn new(mailer: Arc<dyn EmailSender>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl NotificationSender for EmailChannelSender {
    async fn send(&self, config: &ChannelConfig, event: &TransitionEvent) -> Result<(), SenderError> {
        let ChannelConfig::Email(email) = config else {
            return Err(wrong_kind("email", config));
        };
        self.mailer
            .send_mail(&email.email, &subject(event), &render_html(event))
            .await
    }
}
