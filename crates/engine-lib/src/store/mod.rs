//! Persistence seams
//!
//! The engine reads telemetry and auto-mode registrations, and writes
//! decisions and cooldown records, exclusively through these traits.
//! [`PgStore`] backs them with Postgres; [`MemoryStore`] keeps everything
//! in process for tests and offline runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{
    ActionType, AutoModeRegistration, CooldownRecord, DecisionEvent, NewDecision,
    TelemetrySnapshot,
};
use async_trait::async_trait;
use sqlx::migrate::MigrateError;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a history query
pub const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The decision id allocator handed out an id that is already taken
    #[error("decision id conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Read access to the latest telemetry per device
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn latest_snapshot(&self, device_id: &str)
        -> Result<Option<TelemetrySnapshot>, StoreError>;
}

/// Known kits and their auto-mode switches
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn is_registered(&self, device_id: &str) -> Result<bool, StoreError>;

    /// Every (user, device) pair with auto mode enabled
    async fn auto_enabled(&self) -> Result<Vec<AutoModeRegistration>, StoreError>;
}

/// Append-only decision log
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Insert and return the allocated id.
    ///
    /// Implementations must report an id collision as [`StoreError::Conflict`].
    async fn insert_decision(&self, decision: &NewDecision) -> Result<i64, StoreError>;

    /// Move the id allocator past every id currently in use
    async fn repair_sequence(&self) -> Result<(), StoreError>;

    async fn latest_decision(&self, device_id: &str) -> Result<Option<DecisionEvent>, StoreError>;

    /// Newest first
    async fn decision_history(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<DecisionEvent>, StoreError>;
}

/// Outcome of [`CooldownStore::claim_cooldown`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownClaim {
    /// The window was free and now belongs to the claim; `previous` is the
    /// record it replaced
    Granted { previous: Option<CooldownRecord> },
    /// An earlier firing still holds the window
    Held(CooldownRecord),
}

impl CooldownClaim {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Per (device, action type) cooldown state
///
/// Claims must be atomic per key across every process sharing the store:
/// of two concurrent claims inside one window, exactly one is granted.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn cooldown(
        &self,
        device_id: &str,
        action: ActionType,
    ) -> Result<Option<CooldownRecord>, StoreError>;

    /// Write `record` unless the stored firing still holds `window` at
    /// `record.last_fired_at`. A zero window always writes.
    async fn claim_cooldown(
        &self,
        record: &CooldownRecord,
        window: Duration,
    ) -> Result<CooldownClaim, StoreError>;

    /// Put `previous` back (or drop the key) if `claimed` is still the
    /// stored record
    async fn release_cooldown(
        &self,
        claimed: &CooldownRecord,
        previous: Option<&CooldownRecord>,
    ) -> Result<(), StoreError>;
}
