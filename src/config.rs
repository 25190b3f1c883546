use crate::model::{NotificationChannel, Target};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

/// Everything the service persists besides check results.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
    #[serde(default)]
    pub settings: Settings,
    /// Next id to hand out. Ids are never reissued, so a check still running
    /// for a deleted target can't land on its successor.
    #[serde(default)]
    pub next_target_id: u64,
    #[serde(default)]
    pub next_channel_id: u64,
}

impl AppConfig {
    pub fn allocate_target_id(&mut self) -> u64 {
        let floor = self.targets.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let id = self.next_target_id.max(floor);
        self.next_target_id = id + 1;
        id
    }

    pub fn allocate_channel_id(&mut self) -> u64 {
        let floor = self.channels.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let id = self.next_channel_id.max(floor);
        self.next_channel_id = id + 1;
        id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_results_per_target")]
    pub results_per_target: usize,
    /// HTTP endpoint accepting `{from, to, subject, html}`. Without it
    /// email cannot be delivered.
    #[serde(default)]
    pub mail_relay_url: Option<String>,
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    #[serde(default = "default_pagerduty_url")]
    pub pagerduty_events_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            results_per_target: default_results_per_target(),
            mail_relay_url: None,
            mail_from: default_mail_from(),
            pagerduty_events_url: default_pagerduty_url(),
        }
    }
}

fn default_results_per_target() -> usize { 1000 }

fn default_mail_from() -> String { "monitor@upwatch.local".to_string() }

fn default_pagerduty_url() -> String { DEFAULT_PAGERDUTY_EVENTS_URL.to_string() }

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if !path.exists() {
        tracing::info!("Config file {} not found, creating default.", path.display());
        let defaults = AppConfig::default();
        save_config(path, &defaults)?;
        return Ok(defaults);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str::<AppConfig>(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Writes through a sibling temp file so a crash never leaves a torn document.
pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    let mut tmp_file = path.as_os_str().to_owned();
    tmp_file.push(".tmp");
    fs::write(&tmp_file, content).context("Failed to write temp config file")?;
    fs::rename(&tmp_file, path).context("Failed to replace config file")?;
    Ok(())
}
