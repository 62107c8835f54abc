//! User notifications for autonomous decisions

use crate::engine::DecisionOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const AUTO_MODE_TITLE: &str = "Auto Mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub device_id: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    /// Summary of one auto-mode decision for the device owner
    pub fn auto_mode(user_id: &str, outcome: &DecisionOutcome) -> Self {
        let message = if !outcome.actions.is_idle() {
            format!("Auto adjustment: {}", outcome.actions.summary())
        } else if !outcome.suppressed.is_empty() {
            let held = outcome
                .suppressed
                .iter()
                .map(|a| a.label())
                .collect::<Vec<_>>()
                .join(", ");
            format!("No adjustment: cooldown active for {held}")
        } else {
            "All parameters within safe limits".to_string()
        };

        let level = if outcome.critical.is_empty() {
            NotificationLevel::Info
        } else {
            NotificationLevel::Warning
        };

        Self {
            user_id: user_id.to_string(),
            device_id: outcome.device_id.clone(),
            level,
            title: AUTO_MODE_TITLE.to_string(),
            message,
        }
    }
}

/// Delivery channel for notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}
