//! Notification fan-out.
//!
//! Events produced by the monitor and scheduler are dispatched to every
//! enabled channel. Dispatch is best-effort: a failing channel logs an
//! error and never aborts the others, and nothing here ever propagates
//! an error back into the backup pipeline.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::NotificationSettings;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A notification destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Log,
    Webhook,
    Slack,
    Discord,
    Teams,
    Email,
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(Channel::Log),
            "webhook" => Ok(Channel::Webhook),
            "slack" => Ok(Channel::Slack),
            "discord" => Ok(Channel::Discord),
            "teams" => Ok(Channel::Teams),
            "email" => Ok(Channel::Email),
            other => Err(Error::Config(format!("unknown channel '{other}'"))),
        }
    }
}

/// Event classes the per-event gates switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
    Warning,
    Health,
    Summary,
}

/// An operational event worth telling someone about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackupEvent {
    Success {
        container: String,
        size_bytes: u64,
        duration_seconds: f64,
        path: String,
        timestamp: DateTime<Utc>,
    },
    Failure {
        container: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Warning {
        container: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Health {
        status: String,
        message: String,
        available_space_bytes: Option<u64>,
        directory: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Summary {
        total: usize,
        successful: usize,
        failed: usize,
        duration_seconds: f64,
        timestamp: DateTime<Utc>,
    },
}

impl BackupEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BackupEvent::Success { .. } => EventKind::Success,
            BackupEvent::Failure { .. } => EventKind::Failure,
            BackupEvent::Warning { .. } => EventKind::Warning,
            BackupEvent::Health { .. } => EventKind::Health,
            BackupEvent::Summary { .. } => EventKind::Summary,
        }
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            BackupEvent::Success { container, .. } | BackupEvent::Failure { container, .. } => {
                Some(container)
            }
            BackupEvent::Warning { container, .. } => container.as_deref(),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BackupEvent::Success { timestamp, .. }
            | BackupEvent::Failure { timestamp, .. }
            | BackupEvent::Warning { timestamp, .. }
            | BackupEvent::Health { timestamp, .. }
            | BackupEvent::Summary { timestamp, .. } => *timestamp,
        }
    }

    /// Status string carried in payloads and driving the color mapping.
    pub fn status(&self) -> &'static str {
        match self {
            BackupEvent::Success { .. } => "success",
            BackupEvent::Failure { .. } => "failure",
            BackupEvent::Warning { .. } => "warning",
            BackupEvent::Health { .. } => "health",
            BackupEvent::Summary { .. } => "summary",
        }
    }

    /// Human-readable one-liner.
    pub fn message(&self) -> String {
        match self {
            BackupEvent::Success {
                container,
                size_bytes,
                duration_seconds,
                ..
            } => format!(
                "Backup of '{container}' completed: {size_bytes} bytes in {duration_seconds:.1}s"
            ),
            BackupEvent::Failure {
                container, error, ..
            } => format!("Backup of '{container}' failed: {error}"),
            BackupEvent::Warning {
                container, message, ..
            } => match container {
                Some(c) => format!("Warning for '{c}': {message}"),
                None => format!("Warning: {message}"),
            },
            BackupEvent::Health {
                status, message, ..
            } => format!("Health {status}: {message}"),
            BackupEvent::Summary {
                total,
                successful,
                failed,
                duration_seconds,
                ..
            } => format!(
                "Backup cycle finished: {successful}/{total} succeeded, {failed} failed in {duration_seconds:.1}s"
            ),
        }
    }
}

/// Hex color for the card-style channels.
fn color_hex(status: &str) -> &'static str {
    match status {
        "success" => "#36a64f",
        "failure" | "error" => "#dc3545",
        "warning" => "#ff9800",
        _ => "#2196f3",
    }
}

/// Discord wants a decimal color integer.
fn color_decimal(status: &str) -> u32 {
    match status {
        "success" => 0x2ecc71,
        "failure" | "error" => 0xe74c3c,
        "warning" => 0xe67e22,
        _ => 0x3498db,
    }
}

/// Best-effort notification dispatcher.
pub struct Notifier {
    channels: Vec<Channel>,
    settings: NotificationSettings,
    client: Client,
}

impl Notifier {
    /// Build from validated notification settings.
    pub fn from_settings(settings: &NotificationSettings) -> Result<Self> {
        let mut channels = Vec::new();
        for name in &settings.channels {
            let channel = name.parse::<Channel>()?;
            if channel == Channel::Email {
                warn!("email notifications are not supported yet, channel ignored");
                continue;
            }
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            channels,
            settings: settings.clone(),
            client,
        })
    }

    /// Whether the configured gates let this event class through.
    pub fn enabled_for(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Success => self.settings.notify_success,
            EventKind::Failure => self.settings.notify_failures,
            EventKind::Warning => self.settings.notify_warnings,
            EventKind::Health => self.settings.notify_health,
            EventKind::Summary => self.settings.notify_summary,
        }
    }

    /// Fan an event out to every enabled channel.
    pub async fn dispatch(&self, event: &BackupEvent) {
        if !self.enabled_for(event.kind()) {
            return;
        }
        for channel in &self.channels {
            if let Err(e) = self.send(*channel, event).await {
                error!(channel = ?channel, error = %e, "notification dispatch failed");
            }
        }
    }

    async fn send(&self, channel: Channel, event: &BackupEvent) -> Result<()> {
        match channel {
            Channel::Log => {
                let payload = serde_json::to_string(event)?;
                match event.kind() {
                    EventKind::Failure => error!(event = %payload, "{}", event.message()),
                    EventKind::Warning => warn!(event = %payload, "{}", event.message()),
                    _ => info!(event = %payload, "{}", event.message()),
                }
                Ok(())
            }
            Channel::Webhook => {
                let url = self.require_url(self.settings.webhook_url.as_ref(), "BT_WEBHOOK_URL")?;
                self.post(url, &webhook_payload(event)).await
            }
            Channel::Slack => {
                let url = self.require_url(
                    self.settings.slack_webhook_url.as_ref(),
                    "BT_SLACK_WEBHOOK_URL",
                )?;
                self.post(url, &slack_payload(event)).await
            }
            Channel::Discord => {
                let url = self.require_url(
                    self.settings.discord_webhook_url.as_ref(),
                    "BT_DISCORD_WEBHOOK_URL",
                )?;
                self.post(url, &discord_payload(event)).await
            }
            Channel::Teams => {
                let url = self.require_url(
                    self.settings.teams_webhook_url.as_ref(),
                    "BT_TEAMS_WEBHOOK_URL",
                )?;
                self.post(url, &teams_payload(event)).await
            }
            Channel::Email => Ok(()),
        }
    }

    fn require_url<'a>(&self, url: Option<&'a String>, var: &str) -> Result<&'a str> {
        url.map(String::as_str)
            .ok_or_else(|| Error::Config(format!("channel enabled but {var} is not set")))
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Runtime(format!("webhook POST failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Runtime(format!(
                "webhook returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Generic webhook body: the serialized event plus the shared fields.
fn webhook_payload(event: &BackupEvent) -> Value {
    let mut payload = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut payload {
        map.insert("status".into(), json!(event.status()));
        map.insert("message".into(), json!(event.message()));
    }
    payload
}

fn slack_payload(event: &BackupEvent) -> Value {
    let mut fields = vec![json!({
        "title": "Status",
        "value": event.status(),
        "short": true,
    })];
    if let Some(container) = event.container() {
        fields.push(json!({
            "title": "Container",
            "value": container,
            "short": true,
        }));
    }
    json!({
        "attachments": [{
            "color": color_hex(event.status()),
            "title": "Baktainer",
            "text": event.message(),
            "fields": fields,
            "ts": event.timestamp().timestamp(),
        }]
    })
}

fn discord_payload(event: &BackupEvent) -> Value {
    json!({
        "embeds": [{
            "title": "Baktainer",
            "description": event.message(),
            "color": color_decimal(event.status()),
            "timestamp": event.timestamp().to_rfc3339(),
        }]
    })
}

fn teams_payload(event: &BackupEvent) -> Value {
    let mut facts = vec![json!({ "name": "Status", "value": event.status() })];
    if let Some(container) = event.container() {
        facts.push(json!({ "name": "Container", "value": container }));
    }
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": color_hex(event.status()).trim_start_matches('#'),
        "summary": event.message(),
        "sections": [{
            "activityTitle": "Baktainer",
            "text": event.message(),
            "facts": facts,
        }]
    })
}
