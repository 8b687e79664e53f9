//! Alertmanager webhook ingress — payload types and prompt construction.
//!
//! The HTTP route lives in the gateway; this module turns a decoded webhook
//! body into the deterministic prompt string handed to the agent.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::Write;

/// Label keys surfaced first, always in this order.
const CRITICAL_LABELS: [&str; 7] = [
    "alertname",
    "severity",
    "namespace",
    "pod",
    "deployment",
    "service",
    "job",
];

/// Fallback when an alert carries no summary or description annotation.
const NO_SUMMARY: &str = "无摘要信息";

/// A single alert within an Alertmanager webhook message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// "firing" or "resolved"
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub labels: Map<String, Value>,

    #[serde(default)]
    pub annotations: Map<String, Value>,

    pub starts_at: DateTime<Utc>,

    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

/// The Alertmanager webhook message body (v4 schema, fields we consume).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerMessage {
    #[serde(default)]
    pub receiver: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Build the prompt handed to the agent for a webhook notification.
///
/// Deterministic for a fixed payload: critical labels appear in the fixed
/// order above, other labels in payload order.
pub fn build_alert_prompt(msg: &AlertmanagerMessage) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "Received an alert notification from Alertmanager ({}), group status {}, containing {} alert(s).",
        msg.receiver,
        msg.status,
        msg.alerts.len()
    );
    prompt.push_str("Please analyze the following alerts:\n");

    for (i, alert) in msg.alerts.iter().enumerate() {
        let summary = first_annotation(alert, &["summary", "description"]);

        let _ = writeln!(prompt, "\nAlert {} [{}]:", i + 1, alert.status);
        let _ = writeln!(prompt, "  Summary: {summary}");
        let _ = writeln!(prompt, "  Starts at: {}", rfc3339(&alert.starts_at));
        if alert.status == "resolved" {
            if let Some(ends_at) = &alert.ends_at {
                let _ = writeln!(prompt, "  Ends at: {}", rfc3339(ends_at));
            }
        }

        let critical = join_labels(
            CRITICAL_LABELS
                .iter()
                .filter_map(|key| label_str(alert, key).map(|v| (*key, v))),
        );
        if !critical.is_empty() {
            let _ = writeln!(prompt, "  Critical labels: {critical}");
        }

        let other = join_labels(alert.labels.iter().filter_map(|(key, value)| {
            if CRITICAL_LABELS.contains(&key.as_str()) {
                None
            } else {
                value.as_str().map(|v| (key.as_str(), v))
            }
        }));
        if !other.is_empty() {
            let _ = writeln!(prompt, "  Other labels: {other}");
        }
    }

    prompt.push_str(
        "\nPlease analyze and summarize the alerts above. If the alerts reference \
         specific resources, inspect their logs and events first, then send the \
         analysis out through the notification tool.",
    );

    prompt
}

fn first_annotation<'a>(alert: &'a Alert, keys: &[&str]) -> &'a str {
    keys.iter()
        .filter_map(|key| alert.annotations.get(*key))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .unwrap_or(NO_SUMMARY)
}

fn label_str<'a>(alert: &'a Alert, key: &str) -> Option<&'a str> {
    alert.labels.get(key).and_then(Value::as_str)
}

fn join_labels<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
