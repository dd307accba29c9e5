use serde::{Deserialize, Serialize};

use crate::record::Severity;

/// Delivery channel for a business alert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Webhook,
    Dashboard,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Webhook => "webhook",
            NotificationChannel::Dashboard => "dashboard",
        }
    }
}

/// Channels an alert of `severity` is delivered to.
pub fn channels_for(severity: Severity) -> &'static [NotificationChannel] {
    use NotificationChannel::*;
    match severity {
        Severity::Critical => &[Email, Sms, Webhook, Dashboard],
        Severity::High => &[Email, Webhook, Dashboard],
        Severity::Medium => &[Webhook, Dashboard],
        Severity::Low => &[Dashboard],
    }
}
