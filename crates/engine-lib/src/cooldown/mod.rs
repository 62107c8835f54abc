//! Cooldown guard
//!
//! Zeroes any action that already fired on the same device within the
//! cooldown window, unless the device reported a critical reading. Each
//! surviving action claims its window atomically in the store, so engines
//! sharing one database never fire the same action twice in a window.
//! A claim whose decision could not be persisted is handed back with
//! [`CooldownGuard::release`].

mod critical;

pub use critical::{CriticalCondition, CriticalThresholds};

use crate::models::{ActionSet, ActionType, CooldownRecord, TelemetrySnapshot};
use crate::store::{CooldownClaim, CooldownStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Default minimum time between two firings of the same action on a device
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub window: Duration,
    pub critical: CriticalThresholds,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_COOLDOWN,
            critical: CriticalThresholds::default(),
        }
    }
}

/// A window this guard took over, with what it displaced
#[derive(Debug, Clone, PartialEq)]
pub struct HeldWindow {
    pub record: CooldownRecord,
    pub previous: Option<CooldownRecord>,
}

/// Result of screening a candidate action set
#[derive(Debug, Clone, PartialEq)]
pub struct GuardOutcome {
    pub actions: ActionSet,
    /// Actions zeroed because their window was still open
    pub suppressed: Vec<ActionType>,
    /// Non-empty when the window check was skipped
    pub critical: Vec<CriticalCondition>,
    /// Windows claimed for the actions that survived
    pub claims: Vec<HeldWindow>,
}

impl GuardOutcome {
    pub fn bypassed(&self) -> bool {
        !self.critical.is_empty()
    }
}

pub struct CooldownGuard {
    store: Arc<dyn CooldownStore>,
    config: CooldownConfig,
}

impl CooldownGuard {
    pub fn new(store: Arc<dyn CooldownStore>, config: CooldownConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    /// Claim a window for every active action, dropping those still held.
    ///
    /// `reported` is the device's own latest snapshot; `None` when it has
    /// never reported, in which case nothing is treated as critical.
    /// Critical readings still write their records so the next ordinary
    /// firing waits out a full window.
    pub async fn acquire(
        &self,
        device_id: &str,
        candidate: ActionSet,
        reported: Option<&TelemetrySnapshot>,
        now: DateTime<Utc>,
    ) -> Result<GuardOutcome, StoreError> {
        let critical = reported
            .map(|snapshot| self.config.critical.breaches(snapshot))
            .unwrap_or_default();
        let window = if critical.is_empty() {
            self.config.window
        } else {
            Duration::ZERO
        };

        let mut actions = candidate;
        let mut suppressed = Vec::new();
        let mut claims = Vec::new();
        for (action, secs) in candidate.active() {
            let record = CooldownRecord {
                device_id: device_id.to_string(),
                action,
                last_fired_at: now,
                last_value: secs,
            };
            match self.store.claim_cooldown(&record, window).await {
                Ok(CooldownClaim::Granted { previous }) => {
                    claims.push(HeldWindow { record, previous });
                }
                Ok(CooldownClaim::Held(_)) => {
                    actions.suppress(action);
                    suppressed.push(action);
                }
                Err(err) => {
                    self.release(&claims).await;
                    return Err(err);
                }
            }
        }

        Ok(GuardOutcome {
            actions,
            suppressed,
            critical,
            claims,
        })
    }

    /// Hand back windows whose decision never made it to storage
    pub async fn release(&self, claims: &[HeldWindow]) {
        for claim in claims {
            if let Err(err) = self
                .store
                .release_cooldown(&claim.record, claim.previous.as_ref())
                .await
            {
                error!(
                    device_id = %claim.record.device_id,
                    action = claim.record.action.as_str(),
                    error = %err,
                    "Failed to release cooldown claim"
                );
            }
        }
    }
}
