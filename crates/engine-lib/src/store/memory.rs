//! In-process store
//!
//! Mirrors the Postgres semantics closely enough to exercise the engine:
//! decision ids come from a shared counter that behaves like a database
//! sequence, and can be rewound to reproduce id collisions.

use super::{
    CooldownClaim, CooldownStore, DecisionStore, DeviceRegistry, StoreError, TelemetrySource, MAX_HISTORY_LIMIT,
};
use crate::models::{
    ActionType, AutoModeRegistration, CooldownRecord, DecisionEvent, NewDecision,
    TelemetrySnapshot,
};
use crate::notify::{Notification, Notifier};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub struct MemoryStore {
    devices: DashSet<String>,
    telemetry: DashMap<String, TelemetrySnapshot>,
    /// (user, device) -> auto mode
    modes: DashMap<(String, String), bool>,
    cooldowns: DashMap<(String, ActionType), CooldownRecord>,
    decisions: RwLock<BTreeMap<i64, DecisionEvent>>,
    next_id: AtomicI64,
    notifications: Mutex<Vec<Notification>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            devices: DashSet::new(),
            telemetry: DashMap::new(),
            modes: DashMap::new(),
            cooldowns: DashMap::new(),
            decisions: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn register_device(&self, device_id: impl Into<String>) {
        self.devices.insert(device_id.into());
    }

    /// Replace the latest snapshot for its device
    pub fn put_snapshot(&self, snapshot: TelemetrySnapshot) {
        self.telemetry.insert(snapshot.device_id.clone(), snapshot);
    }

    pub fn set_auto_mode(&self, user_id: &str, device_id: &str, enabled: bool) {
        self.modes
            .insert((user_id.to_string(), device_id.to_string()), enabled);
    }

    /// Rewind the id counter, as a bulk import that bypassed it would
    pub fn rewind_sequence(&self, next: i64) {
        self.next_id.store(next, Ordering::SeqCst);
    }

    pub async fn decision_count(&self) -> usize {
        self.decisions.read().await.len()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().await.clone()
    }
}

#[async_trait]
impl TelemetrySource for MemoryStore {
    async fn latest_snapshot(
        &self,
        device_id: &str,
    ) -> Result<Option<TelemetrySnapshot>, StoreError> {
        Ok(self.telemetry.get(device_id).map(|s| s.value().clone()))
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn is_registered(&self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.devices.contains(device_id))
    }

    async fn auto_enabled(&self) -> Result<Vec<AutoModeRegistration>, StoreError> {
        let mut enabled: Vec<AutoModeRegistration> = self
            .modes
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| AutoModeRegistration {
                user_id: entry.key().0.clone(),
                device_id: entry.key().1.clone(),
                enabled: true,
            })
            .collect();
        enabled.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.user_id.cmp(&b.user_id)));
        Ok(enabled)
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn insert_decision(&self, decision: &NewDecision) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut decisions = self.decisions.write().await;
        if decisions.contains_key(&id) {
            return Err(StoreError::Conflict(format!("Key (id)=({id}) already exists")));
        }
        decisions.insert(id, DecisionEvent::from_new(id, decision));
        Ok(id)
    }

    async fn repair_sequence(&self) -> Result<(), StoreError> {
        let decisions = self.decisions.read().await;
        let next = decisions.keys().next_back().map_or(1, |id| id + 1);
        self.next_id.fetch_max(next, Ordering::SeqCst);
        Ok(())
    }

    async fn latest_decision(&self, device_id: &str) -> Result<Option<DecisionEvent>, StoreError> {
        let decisions = self.decisions.read().await;
        Ok(decisions
            .values()
            .filter(|event| event.device_id == device_id)
            .max_by_key(|event| (event.ingest_time, event.id))
            .cloned())
    }

    async fn decision_history(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<DecisionEvent>, StoreError> {
        let decisions = self.decisions.read().await;
        let mut events: Vec<DecisionEvent> = decisions
            .values()
            .filter(|event| event.device_id == device_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| (b.ingest_time, b.id).cmp(&(a.ingest_time, a.id)));
        events.truncate(limit.min(MAX_HISTORY_LIMIT) as usize);
        Ok(events)
    }
}

#[async_trait]
impl CooldownStore for MemoryStore {
    async fn cooldown(
        &self,
        device_id: &str,
        action: ActionType,
    ) -> Result<Option<CooldownRecord>, StoreError> {
        Ok(self
            .cooldowns
            .get(&(device_id.to_string(), action))
            .map(|r| r.value().clone()))
    }

    async fn claim_cooldown(
        &self,
        record: &CooldownRecord,
        window: Duration,
    ) -> Result<CooldownClaim, StoreError> {
        // The entry guard holds the shard lock for the whole check-and-set
        match self.cooldowns.entry((record.device_id.clone(), record.action)) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(CooldownClaim::Granted { previous: None })
            }
            Entry::Occupied(mut slot) => {
                if slot.get().holds(record.last_fired_at, window) {
                    return Ok(CooldownClaim::Held(slot.get().clone()));
                }
                let previous = slot.insert(record.clone());
                Ok(CooldownClaim::Granted {
                    previous: Some(previous),
                })
            }
        }
    }

    async fn release_cooldown(
        &self,
        claimed: &CooldownRecord,
        previous: Option<&CooldownRecord>,
    ) -> Result<(), StoreError> {
        if let Entry::Occupied(mut slot) = self
            .cooldowns
            .entry((claimed.device_id.clone(), claimed.action))
        {
            if slot.get() == claimed {
                match previous {
                    Some(record) => {
                        slot.insert(record.clone());
                    }
                    None => {
                        slot.remove();
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MemoryStore {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.notifications.lock().await.push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionSet, ActionSource};
    use chrono::{Duration, Utc};

    fn decision(device_id: &str, offset_secs: i64) -> NewDecision {
        NewDecision {
            device_id: device_id.to_string(),
            recorded_at: Utc::now() + Duration::seconds(offset_secs),
            actions: ActionSet::idle(ActionSource::Rule).with(ActionType::PhUp, 2),
            manual: false,
            auto: true,
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = MemoryStore::new();
        let first = store.insert_decision(&decision("kit-1", 0)).await.unwrap();
        let second = store.insert_decision(&decision("kit-2", 1)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_rewound_sequence_conflicts_until_repaired() {
        let store = MemoryStore::new();
        store.insert_decision(&decision("kit-1", 0)).await.unwrap();
        store.insert_decision(&decision("kit-1", 1)).await.unwrap();

        store.rewind_sequence(1);
        let err = store.insert_decision(&decision("kit-1", 2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.repair_sequence().await.unwrap();
        let id = store.insert_decision(&decision("kit-1", 2)).await.unwrap();
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_scoped_to_device() {
        let store = MemoryStore::new();
        for offset in 0..5 {
            store.insert_decision(&decision("kit-1", offset)).await.unwrap();
        }
        store.insert_decision(&decision("kit-2", 10)).await.unwrap();

        let history = store.decision_history("kit-1", 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.device_id == "kit-1"));
        assert!(history[0].ingest_time > history[1].ingest_time);

        let latest = store.latest_decision("kit-1").await.unwrap().unwrap();
        assert_eq!(latest.id, history[0].id);
    }

    fn fired(action: ActionType, at: chrono::DateTime<Utc>, secs: u32) -> CooldownRecord {
        CooldownRecord {
            device_id: "kit-1".to_string(),
            action,
            last_fired_at: at,
            last_value: secs,
        }
    }

    #[tokio::test]
    async fn test_claim_is_held_inside_window() {
        let store = MemoryStore::new();
        let window = std::time::Duration::from_secs(180);
        let t0 = Utc::now();

        let first = store
            .claim_cooldown(&fired(ActionType::Refill, t0, 6), window)
            .await
            .unwrap();
        assert_eq!(first, CooldownClaim::Granted { previous: None });

        let inside = fired(ActionType::Refill, t0 + Duration::seconds(60), 3);
        let held = store.claim_cooldown(&inside, window).await.unwrap();
        assert_eq!(held, CooldownClaim::Held(fired(ActionType::Refill, t0, 6)));

        let after = fired(ActionType::Refill, t0 + Duration::seconds(180), 3);
        let granted = store.claim_cooldown(&after, window).await.unwrap();
        assert_eq!(
            granted,
            CooldownClaim::Granted {
                previous: Some(fired(ActionType::Refill, t0, 6))
            }
        );

        let stored = store.cooldown("kit-1", ActionType::Refill).await.unwrap().unwrap();
        assert_eq!(stored.last_value, 3);
        assert!(store.cooldown("kit-1", ActionType::PhUp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_window_claim_always_writes() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store
            .claim_cooldown(&fired(ActionType::PhUp, t0, 4), std::time::Duration::from_secs(180))
            .await
            .unwrap();

        let forced = fired(ActionType::PhUp, t0 + Duration::seconds(1), 12);
        let claim = store
            .claim_cooldown(&forced, std::time::Duration::ZERO)
            .await
            .unwrap();
        assert!(claim.is_granted());
        assert_eq!(store.cooldown("kit-1", ActionType::PhUp).await.unwrap(), Some(forced));
    }

    #[tokio::test]
    async fn test_concurrent_claims_grant_once() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let window = std::time::Duration::from_secs(180);
        let t0 = Utc::now();

        let claims = (0..8).map(|i| {
            let store = store.clone();
            let record = fired(ActionType::PhUp, t0 + Duration::milliseconds(i), 4);
            tokio::spawn(async move { store.claim_cooldown(&record, window).await.unwrap() })
        });
        let granted = futures::future::join_all(claims)
            .await
            .into_iter()
            .filter(|claim| claim.as_ref().unwrap().is_granted())
            .count();
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_release_restores_only_own_claim() {
        let store = MemoryStore::new();
        let window = std::time::Duration::from_secs(180);
        let t0 = Utc::now();
        let original = fired(ActionType::PhUp, t0, 4);
        store.claim_cooldown(&original, window).await.unwrap();

        let claimed = fired(ActionType::PhUp, t0 + Duration::seconds(200), 4);
        store.claim_cooldown(&claimed, window).await.unwrap();
        store.release_cooldown(&claimed, Some(&original)).await.unwrap();
        assert_eq!(
            store.cooldown("kit-1", ActionType::PhUp).await.unwrap(),
            Some(original.clone())
        );

        // Someone else owns the key now; a stale release leaves it alone
        let newer = fired(ActionType::PhUp, t0 + Duration::seconds(400), 4);
        store.claim_cooldown(&newer, window).await.unwrap();
        store.release_cooldown(&claimed, Some(&original)).await.unwrap();
        assert_eq!(store.cooldown("kit-1", ActionType::PhUp).await.unwrap(), Some(newer));

        let refill = fired(ActionType::Refill, t0, 6);
        store.claim_cooldown(&refill, window).await.unwrap();
        store.release_cooldown(&refill, None).await.unwrap();
        assert!(store.cooldown("kit-1", ActionType::Refill).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_enabled_skips_disabled_pairs() {
        let store = MemoryStore::new();
        store.set_auto_mode("user-1", "kit-b", true);
        store.set_auto_mode("user-2", "kit-a", true);
        store.set_auto_mode("user-3", "kit-c", false);

        let enabled = store.auto_enabled().await.unwrap();
        let devices: Vec<&str> = enabled.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(devices, vec!["kit-a", "kit-b"]);
    }
}
