//! Typed channel configuration.
//!
//! Channels are stored with their configuration as a raw JSON string. It is
//! parsed into [`ChannelConfig`] when a channel is created or updated, and
//! again before every dispatch.

use crate::model::ChannelKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelConfigError {
    #[error("channel name must not be empty")]
    EmptyName,
    #[error("configuration must be a valid JSON object: {0}")]
    InvalidJson(String),
    #[error("{kind} channel requires \"{field}\" field in config")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("unsupported webhook method '{0}'")]
    InvalidMethod(String),
    #[error("invalid webhook header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailConfig {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PagerDutyConfig {
    #[serde(default)]
    pub routing_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body with `{{PLACEHOLDER}}` substitutions; replaces the default body.
    #[serde(default)]
    pub template: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelConfig {
    Email(EmailConfig),
    Slack(SlackConfig),
    PagerDuty(PagerDutyConfig),
    Webhook(WebhookConfig),
}

impl ChannelConfig {
    /// Parses `raw` as the configuration for `kind` and checks the field
    /// that kind cannot work without.
    pub fn parse(kind: ChannelKind, raw: &str) -> Result<Self, ChannelConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ChannelConfigError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(ChannelConfigError::InvalidJson("expected an object".into()));
        }

        let missing = |field| ChannelConfigError::MissingField {
            kind: kind.as_str(),
            field,
        };
        let invalid = |e: serde_json::Error| ChannelConfigError::InvalidJson(e.to_string());

        match kind {
            ChannelKind::Email => {
                let config: EmailConfig = serde_json::from_value(value).map_err(invalid)?;
                if config.email.trim().is_empty() {
                    return Err(missing("email"));
                }
                Ok(ChannelConfig::Email(config))
            }
            ChannelKind::Slack => {
                let config: SlackConfig = serde_json::from_value(value).map_err(invalid)?;
                if config.webhook_url.trim().is_empty() {
                    return Err(missing("webhookUrl"));
                }
                Ok(ChannelConfig::Slack(config))
            }
            ChannelKind::PagerDuty => {
                let config: PagerDutyConfig = serde_json::from_value(value).map_err(invalid)?;
                if config.routing_key.trim().is_empty() {
                    return Err(missing("routingKey"));
                }
                Ok(ChannelConfig::PagerDuty(config))
            }
            ChannelKind::Webhook => {
                let config: WebhookConfig = serde_json::from_value(value).map_err(invalid)?;
                if config.url.trim().is_empty() {
                    return Err(missing("url"));
                }
                if reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes()).is_err() {
                    return Err(ChannelConfigError::InvalidMethod(config.method));
                }
                for (name, value) in &config.headers {
                    let invalid = |reason: String| ChannelConfigError::InvalidHeader {
                        name: name.clone(),
                        reason,
                    };
                    reqwest::header::HeaderName::from_bytes(name.as_bytes())
                        .map_err(|e| invalid(e.to_string()))?;
                    reqwest::header::HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
                }
                Ok(ChannelConfig::Webhook(config))
            }
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::Email(_) => ChannelKind::Email,
            ChannelConfig::Slack(_) => ChannelKind::Slack,
            ChannelConfig::PagerDuty(_) => ChannelKind::PagerDuty,
            ChannelConfig::Webhook(_) => ChannelKind::Webhook,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_kind() {
        assert_eq!(
            ChannelConfig::parse(ChannelKind::Email, r#"{"email":"ops@example.com"}"#),
            Ok(ChannelConfig::Email(EmailConfig { email: "ops@example.com".into() }))
        );
        assert_eq!(
            ChannelConfig::parse(ChannelKind::Slack, r#"{"webhookUrl":"https://hooks/x"}"#)
                .map(|c| c.kind()),
            Ok(ChannelKind::Slack)
        );
        assert_eq!(
            ChannelConfig::parse(ChannelKind::PagerDuty, r#"{"routingKey":"abc"}"#).map(|c| c.kind()),
            Ok(ChannelKind::PagerDuty)
        );

        match ChannelConfig::parse(ChannelKind::Webhook, r#"{"url":"https://h/x"}"#).unwrap() {
            ChannelConfig::Webhook(w) => {
                assert_eq!(w.method, "POST");
                assert!(w.headers.is_empty());
                assert!(w.template.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_required_field() {
        assert_eq!(
            ChannelConfig::parse(ChannelKind::PagerDuty, r#"{"routing_key":"abc"}"#),
            Err(ChannelConfigError::MissingField {
                kind: "pagerduty",
                field: "routingKey"
            })
        );
        assert!(matches!(
            ChannelConfig::parse(ChannelKind::Email, r#"{"email":"  "}"#),
            Err(ChannelConfigError::MissingField { field: "email", .. })
        ));
        assert!(matches!(
            ChannelConfig::parse(ChannelKind::Webhook, "{}"),
            Err(ChannelConfigError::MissingField { field: "url", .. })
        ));
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(matches!(
            ChannelConfig::parse(ChannelKind::Email, "not json"),
            Err(ChannelConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            ChannelConfig::parse(ChannelKind::Email, r#"["ops@example.com"]"#),
            Err(ChannelConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            ChannelConfig::parse(ChannelKind::Slack, r#"{"webhookUrl": 12}"#),
            Err(ChannelConfigError::InvalidJson(_))
        ));
    }

    #[test]
    fn rejects_bad_webhook_method() {
        assert_eq!(
            ChannelConfig::parse(ChannelKind::Webhook, r#"{"url":"https://h","method":"PO ST"}"#),
            Err(ChannelConfigError::InvalidMethod("PO ST".into()))
        );
    }

    #[test]
    fn rejects_headers_reqwest_would_refuse() {
        assert!(matches!(
            ChannelConfig::parse(
                ChannelKind::Webhook,
                r#"{"url":"https://h","headers":{"Bad Name":"x"}}"#
            ),
            Err(ChannelConfigError::InvalidHeader { name, .. }) if name == "Bad Name"
        ));
        assert!(matches!(
            ChannelConfig::parse(
                ChannelKind::Webhook,
                r#"{"url":"https://h","headers":{"x-token":"line\nbreak"}}"#
            ),
            Err(ChannelConfigError::InvalidHeader { .. })
        ));
        assert!(ChannelConfig::parse(
            ChannelKind::Webhook,
            r#"{"url":"https://h","headers":{"Authorization":"Bearer abc"}}"#
        )
        .is_ok());
    }
}
