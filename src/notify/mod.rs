//! Alert fan-out for UP/DOWN transitions.

pub mod channel;
pub mod senders;

use crate::config::Settings;
use crate::model::{CheckKind, CheckResult, NotificationChannel, Status, Target};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use channel::ChannelConfig;
use senders::email::{self, EmailChannelSender, EmailSender, MailRelay, NoRelay};
use senders::pagerduty::PagerDutySender;
use senders::slack::SlackSender;
use senders::webhook::WebhookSender;
use senders::{NotificationSender, SenderError};
use std::sync::Arc;
use std::time::Duration;

/// A change between the two most recent statuses of one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub target_name: String,
    pub target_kind: CheckKind,
    pub target_endpoint: String,
    pub status: Status,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    /// The probe message is only carried on DOWN; recoveries report latency alone.
    pub fn new(target: &Target, latest: &CheckResult) -> Self {
        let message = match latest.status {
            Status::Down if !latest.message.is_empty() => Some(latest.message.clone()),
            _ => None,
        };
        Self {
            target_name: target.name.clone(),
            target_kind: target.kind,
            target_endpoint: target.endpoint.clone(),
            status: latest.status,
            message,
            latency_ms: Some(latest.latency_ms),
            timestamp: latest.created_at,
        }
    }
}

/// Where the scheduler hands transition events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers to every channel independently. Never fails; problems are logged.
    async fn notify(&self, event: &TransitionEvent, channels: &[NotificationChannel]);

    /// The per-target legacy alert address.
    async fn send_alert_email(&self, to: &str, event: &TransitionEvent);
}

pub struct Dispatcher {
    mailer: Arc<dyn EmailSender>,
    email: EmailChannelSender,
    slack: SlackSender,
    pagerduty: PagerDutySender,
    webhook: WebhookSender,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, mailer: Arc<dyn EmailSender>, pagerduty_url: impl Into<String>) -> Self {
        Self {
            email: EmailChannelSender::new(mailer.clone()),
            mailer,
            slack: SlackSender::new(client.clone()),
            pagerduty: PagerDutySender::new(client.clone(), pagerduty_url),
            webhook: WebhookSender::new(client),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("upwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let mailer: Arc<dyn EmailSender> = match &settings.mail_relay_url {
            Some(url) => Arc::new(MailRelay::new(client.clone(), url, &settings.mail_from)),
            None => Arc::new(NoRelay),
        };
        Self::new(client, mailer, &settings.pagerduty_events_url)
    }

    fn sender_for(&self, config: &ChannelConfig) -> &dyn NotificationSender {
        match config {
            ChannelConfig::Email(_) => &self.email,
            ChannelConfig::Slack(_) => &self.slack,
            ChannelConfig::PagerDuty(_) => &self.pagerduty,
            ChannelConfig::Webhook(_) => &self.webhook,
        }
    }

    /// Parses the channel's stored config and delivers through it.
    pub async fn send_to_channel(
        &self,
        channel: &NotificationChannel,
        event: &TransitionEvent,
    ) -> Result<(), SenderError> {
        let config = ChannelConfig::parse(channel.kind, &channel.config)?;
        self.sender_for(&config).send(&config, event).await
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn notify(&self, event: &TransitionEvent, channels: &[NotificationChannel]) {
        let deliveries = channels.iter().filter(|c| c.enabled).map(|channel| async move {
            match self.send_to_channel(channel, event).await {
                Ok(()) => tracing::info!(
                    channel = %channel.name,
                    target = %event.target_name,
                    status = event.status.as_str(),
                    "Notification sent"
                ),
                Err(SenderError::Config(e)) => {
                    tracing::warn!(channel = %channel.name, "Skipping channel with invalid config: {}", e)
                }
                Err(e @ SenderError::NotDelivered(_)) => tracing::warn!(channel = %channel.name, "{}", e),
                Err(e) => tracing::error!(channel = %channel.name, "Failed to send notification: {}", e),
            }
        });
        futures::future::join_all(deliveries).await;
    }

    async fn send_alert_email(&self, to: &str, event: &TransitionEvent) {
        if to.is_empty() {
            return;
        }
        match self
            .mailer
            .send_mail(to, &email::subject(event), &email::render_html(event))
            .await
        {
            Ok(()) => {}
            Err(e @ SenderError::NotDelivered(_)) => tracing::warn!("{}", e),
            Err(e) => tracing::error!("Alert send failed to {}: {}", to, e),
        }
    }
}
