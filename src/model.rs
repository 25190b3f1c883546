use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_INTERVAL_SEC: u64 = 10;
pub const MAX_INTERVAL_SEC: u64 = 86_400;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;
pub const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckKind {
    Http,
    Tcp,
    Icmp,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "HTTP",
            CheckKind::Tcp => "TCP",
            CheckKind::Icmp => "ICMP",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            Status::Up
        } else {
            Status::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: u64,
    pub name: String,
    pub kind: CheckKind,
    pub endpoint: String, // URL, host:port or hostname depending on kind
    pub interval_sec: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub expected_code: Option<u16>,
    #[serde(default)]
    pub alert_email: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// Administrative input for creating or replacing a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInput {
    pub name: String,
    pub kind: CheckKind,
    pub endpoint: String,
    pub interval_sec: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub expected_code: Option<u16>,
    #[serde(default)]
    pub alert_email: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("interval must be between 10 and 86400 seconds, got {0}")]
    IntervalOutOfRange(u64),
    #[error("timeout must be between 1000 and 60000 ms, got {0}")]
    TimeoutOutOfRange(u64),
    #[error("invalid {kind} endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        kind: &'static str,
        endpoint: String,
        reason: String,
    },
    #[error("expected code {0} is not a valid HTTP status")]
    InvalidExpectedCode(u16),
    #[error("alert email '{0}' is not an address")]
    InvalidAlertEmail(String),
}

impl TargetInput {
    /// Normalizes whitespace and checks every field against its kind.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        self.name = self.name.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.alert_email = self
            .alert_email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !(MIN_INTERVAL_SEC..=MAX_INTERVAL_SEC).contains(&self.interval_sec) {
            return Err(ValidationError::IntervalOutOfRange(self.interval_sec));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ValidationError::TimeoutOutOfRange(self.timeout_ms));
        }
        validate_endpoint(self.kind, &self.endpoint)?;
        if let Some(code) = self.expected_code {
            if !(100..=599).contains(&code) {
                return Err(ValidationError::InvalidExpectedCode(code));
            }
        }
        if let Some(email) = &self.alert_email {
            if !email.contains('@') || email.chars().any(char::is_whitespace) {
                return Err(ValidationError::InvalidAlertEmail(email.clone()));
            }
        }
        Ok(self)
    }

    pub fn into_target(self, id: u64, created_at: DateTime<Utc>) -> Target {
        Target {
            id,
            name: self.name,
            kind: self.kind,
            endpoint: self.endpoint,
            interval_sec: self.interval_sec,
            timeout_ms: self.timeout_ms,
            expected_code: self.expected_code,
            alert_email: self.alert_email,
            enabled: self.enabled,
            created_at,
        }
    }
}

fn validate_endpoint(kind: CheckKind, endpoint: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidEndpoint {
        kind: kind.as_str(),
        endpoint: endpoint.to_string(),
        reason,
    };

    match kind {
        CheckKind::Http => {
            let url = reqwest::Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
            }
            if url.host_str().is_none() {
                return Err(invalid("missing host".into()));
            }
            Ok(())
        }
        CheckKind::Tcp => parse_host_port(endpoint).map(|_| ()).map_err(invalid),
        CheckKind::Icmp => {
            if endpoint.is_empty() || endpoint.chars().any(char::is_whitespace) {
                Err(invalid("expected a hostname or IP address".into()))
            } else {
                Ok(())
            }
        }
    }
}

/// Splits `host:port`, accepting `[v6addr]:port`.
pub fn parse_host_port(endpoint: &str) -> Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated '[' in IPv6 address".to_string())?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        (host, port)
    } else {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        if host.contains(':') {
            return Err("IPv6 addresses must be written as [addr]:port".into());
        }
        (host, port)
    };

    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err("missing host".into());
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port '{}'", port))?;
    if port == 0 {
        return Err("port must be non-zero".into());
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub id: u64,
    pub target_id: u64,
    pub status: Status,
    pub latency_ms: u64,
    pub code: u16,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCheckResult {
    pub target_id: u64,
    pub status: Status,
    pub latency_ms: u64,
    pub code: u16,
    pub message: String,
}

impl NewCheckResult {
    pub fn new(target_id: u64, status: Status, latency_ms: u64, code: u16, message: &str) -> Self {
        Self {
            target_id,
            status,
            latency_ms,
            code,
            message: truncate_chars(message, MAX_MESSAGE_CHARS),
        }
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Payload pushed to live dashboard subscribers for every completed check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResultEvent {
    pub target_id: u64,
    pub name: String,
    pub kind: CheckKind,
    pub status: Status,
    pub latency_ms: u64,
    pub code: u16,
    pub at: DateTime<Utc>,
}

impl CheckResultEvent {
    pub fn new(target: &Target, result: &CheckResult) -> Self {
        Self {
            target_id: target.id,
            name: target.name.clone(),
            kind: target.kind,
            status: result.status,
            latency_ms: result.latency_ms,
            code: result.code,
            at: result.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Slack,
    #[serde(rename = "pagerduty")]
    PagerDuty,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::PagerDuty => "pagerduty",
            ChannelKind::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationChannel {
    pub id: u64,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub config: String, // JSON object, validated per kind
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInput {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub config: String,
}

/// A target together with its most recent check, for dashboard snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub target: Target,
    pub latest: Option<CheckResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: CheckKind, endpoint: &str) -> TargetInput {
        TargetInput {
            name: "api".into(),
            kind,
            endpoint: endpoint.into(),
            interval_sec: 60,
            timeout_ms: 5000,
            expected_code: None,
            alert_email: None,
            enabled: true,
        }
    }

    #[test]
    fn accepts_well_formed_targets() {
        assert!(input(CheckKind::Http, "https://example.com/health").validate().is_ok());
        assert!(input(CheckKind::Tcp, "db.internal:5432").validate().is_ok());
        assert!(input(CheckKind::Tcp, "[::1]:22").validate().is_ok());
        assert!(input(CheckKind::Icmp, "10.0.0.1").validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_cadence() {
        let mut t = input(CheckKind::Icmp, "host");
        t.interval_sec = 5;
        assert_eq!(t.validate(), Err(ValidationError::IntervalOutOfRange(5)));

        let mut t = input(CheckKind::Icmp, "host");
        t.timeout_ms = 60_001;
        assert_eq!(t.validate(), Err(ValidationError::TimeoutOutOfRange(60_001)));
    }

    #[test]
    fn rejects_endpoint_that_does_not_match_kind() {
        assert!(matches!(
            input(CheckKind::Http, "example.com").validate(),
            Err(ValidationError::InvalidEndpoint { kind: "HTTP", .. })
        ));
        assert!(matches!(
            input(CheckKind::Http, "ftp://example.com").validate(),
            Err(ValidationError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            input(CheckKind::Tcp, "example.com").validate(),
            Err(ValidationError::InvalidEndpoint { kind: "TCP", .. })
        ));
        assert!(matches!(
            input(CheckKind::Icmp, "two words").validate(),
            Err(ValidationError::InvalidEndpoint { kind: "ICMP", .. })
        ));
    }

    #[test]
    fn trims_and_drops_blank_alert_email() {
        let mut t = input(CheckKind::Icmp, "  host  ");
        t.alert_email = Some("   ".into());
        let t = t.validate().unwrap();
        assert_eq!(t.endpoint, "host");
        assert_eq!(t.alert_email, None);
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("a.b:80"), Ok(("a.b".into(), 80)));
        assert_eq!(parse_host_port("[fe80::1]:443"), Ok(("fe80::1".into(), 443)));
        assert!(parse_host_port("a.b:").is_err());
        assert!(parse_host_port(":80").is_err());
        assert!(parse_host_port("a.b:0").is_err());
        assert!(parse_host_port("a.b:99999").is_err());
        assert!(parse_host_port("fe80::1:80").is_err());
    }

    #[test]
    fn message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_CHARS + 20);
        let r = NewCheckResult::new(1, Status::Down, 0, 0, &long);
        assert_eq!(r.message.chars().count(), MAX_MESSAGE_CHARS);

        let r = NewCheckResult::new(1, Status::Up, 0, 200, "OK");
        assert_eq!(r.message, "OK");
    }

    #[test]
    fn wire_names() {
        assert_eq!(serde_json::to_string(&CheckKind::Icmp).unwrap(), "\"ICMP\"");
        assert_eq!(serde_json::to_string(&Status::Down).unwrap(), "\"DOWN\"");
        assert_eq!(serde_json::to_string(&ChannelKind::PagerDuty).unwrap(), "\"pagerduty\"");
    }
}
