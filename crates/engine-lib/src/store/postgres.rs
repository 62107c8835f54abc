//! Postgres-backed store
//!
//! Column names follow the camelCase layout shared with the ingestion API.

use super::{
    CooldownClaim, CooldownStore, DecisionStore, DeviceRegistry, StoreError, TelemetrySource, MAX_HISTORY_LIMIT,
};
use crate::models::{
    ActionSet, ActionSource, ActionType, AutoModeRegistration, CooldownRecord, DecisionEvent,
    NewDecision, TelemetrySnapshot,
};
use crate::notify::{Notification, Notifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::warn;

const DECISION_COLUMNS: &str = r#"id, "deviceId", "ingestTime", "phUp", "phDown", "nutrientAdd",
    "refill", "manual", "auto", source"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

/// NULL sensor columns read as zero, loudly
fn reading_or_zero(device_id: &str, column: &str, value: Option<f64>) -> f64 {
    value.unwrap_or_else(|| {
        warn!(
            device_id = %device_id,
            column = column,
            "Telemetry column is NULL, reading it as 0"
        );
        0.0
    })
}

fn cooldown_from_row(
    row: &PgRow,
    device_id: &str,
    action: ActionType,
) -> Result<CooldownRecord, StoreError> {
    let last_value: i32 = row.try_get("lastValue")?;
    Ok(CooldownRecord {
        device_id: device_id.to_string(),
        action,
        last_fired_at: row.try_get("lastFiredAt")?,
        last_value: u32::try_from(last_value).unwrap_or(0),
    })
}

fn duration_column(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.map_or(0, |v| u32::try_from(v).unwrap_or(0)))
}

fn flag_column(row: &PgRow, column: &str) -> Result<bool, StoreError> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.unwrap_or(0) != 0)
}

fn decision_from_row(row: &PgRow) -> Result<DecisionEvent, StoreError> {
    let id: i32 = row.try_get("id")?;
    let source_str: String = row.try_get("source")?;
    let source = ActionSource::parse(&source_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown decision source '{source_str}'")))?;

    let actions = ActionSet::idle(source)
        .with(ActionType::PhUp, duration_column(row, "phUp")?)
        .with(ActionType::PhDown, duration_column(row, "phDown")?)
        .with(ActionType::NutrientAdd, duration_column(row, "nutrientAdd")?)
        .with(ActionType::Refill, duration_column(row, "refill")?);

    Ok(DecisionEvent {
        id: i64::from(id),
        device_id: row.try_get("deviceId")?,
        ingest_time: millis_to_utc(row.try_get("ingestTime")?)?,
        actions,
        manual: flag_column(row, "manual")?,
        auto: flag_column(row, "auto")?,
    })
}

fn insert_error(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl TelemetrySource for PgStore {
    async fn latest_snapshot(
        &self,
        device_id: &str,
    ) -> Result<Option<TelemetrySnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT "deviceId", "ingestTime", ppm, ph, "tempC", humidity, "waterTemp", "waterLevel"
            FROM telemetry
            WHERE "deviceId" = $1
            ORDER BY "ingestTime" DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let reading = |column: &str| -> Result<f64, StoreError> {
            let value: Option<f64> = row.try_get(column)?;
            Ok(reading_or_zero(device_id, column, value))
        };

        Ok(Some(TelemetrySnapshot {
            device_id: row.try_get("deviceId")?,
            ppm: reading("ppm")?,
            ph: reading("ph")?,
            temp_c: reading("tempC")?,
            humidity: reading("humidity")?,
            water_temp: reading("waterTemp")?,
            water_level: reading("waterLevel")?,
            captured_at: millis_to_utc(row.try_get("ingestTime")?)?,
        }))
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn is_registered(&self, device_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM kits WHERE id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn auto_enabled(&self) -> Result<Vec<AutoModeRegistration>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT "deviceId", "userId"
            FROM device_mode
            WHERE "autoMode" = TRUE
            ORDER BY "deviceId", "userId"
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AutoModeRegistration, StoreError> {
                Ok(AutoModeRegistration {
                    device_id: row.try_get("deviceId")?,
                    user_id: row.try_get("userId")?,
                    enabled: true,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DecisionStore for PgStore {
    async fn insert_decision(&self, decision: &NewDecision) -> Result<i64, StoreError> {
        let actions = &decision.actions;
        let row = sqlx::query(
            r#"
            INSERT INTO actuator_event (
                "deviceId", "ingestTime",
                "phUp", "phDown", "nutrientAdd", "valueS",
                "manual", "auto", "refill", source
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&decision.device_id)
        .bind(decision.recorded_at.timestamp_millis())
        .bind(actions.ph_up() as i32)
        .bind(actions.ph_down() as i32)
        .bind(actions.nutrient_add() as i32)
        .bind(f64::from(actions.value_s()))
        .bind(i32::from(decision.manual))
        .bind(i32::from(decision.auto))
        .bind(actions.refill() as i32)
        .bind(actions.source().as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(insert_error)?;

        let id: i32 = row.try_get("id")?;
        Ok(i64::from(id))
    }

    async fn repair_sequence(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            SELECT setval(
                pg_get_serial_sequence('actuator_event', 'id'),
                COALESCE((SELECT MAX(id) FROM actuator_event), 0) + 1,
                false
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_decision(&self, device_id: &str) -> Result<Option<DecisionEvent>, StoreError> {
        let query = format!(
            r#"SELECT {DECISION_COLUMNS} FROM actuator_event
            WHERE "deviceId" = $1
            ORDER BY "ingestTime" DESC, id DESC
            LIMIT 1"#
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decision_from_row).transpose()
    }

    async fn decision_history(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<DecisionEvent>, StoreError> {
        let query = format!(
            r#"SELECT {DECISION_COLUMNS} FROM actuator_event
            WHERE "deviceId" = $1
            ORDER BY "ingestTime" DESC, id DESC
            LIMIT $2"#
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .bind(i64::from(limit.min(MAX_HISTORY_LIMIT)))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decision_from_row).collect()
    }
}

#[async_trait]
impl CooldownStore for PgStore {
    async fn cooldown(
        &self,
        device_id: &str,
        action: ActionType,
    ) -> Result<Option<CooldownRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT "lastFiredAt", "lastValue"
            FROM actuator_cooldown
            WHERE "deviceId" = $1 AND "actionType" = $2
            "#,
        )
        .bind(device_id)
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| cooldown_from_row(row, device_id, action))
            .transpose()
    }

    async fn claim_cooldown(
        &self,
        record: &CooldownRecord,
        window: Duration,
    ) -> Result<CooldownClaim, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO actuator_cooldown ("deviceId", "actionType", "lastFiredAt", "lastValue")
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ("deviceId", "actionType") DO NOTHING
            RETURNING 1 AS claimed
            "#,
        )
        .bind(&record.device_id)
        .bind(record.action.as_str())
        .bind(record.last_fired_at)
        .bind(record.last_value as i32)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_some() {
            tx.commit().await?;
            return Ok(CooldownClaim::Granted { previous: None });
        }

        // The row exists: lock it so concurrent claimers queue behind this one
        let row = sqlx::query(
            r#"
            SELECT "lastFiredAt", "lastValue"
            FROM actuator_cooldown
            WHERE "deviceId" = $1 AND "actionType" = $2
            FOR UPDATE
            "#,
        )
        .bind(&record.device_id)
        .bind(record.action.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let current = cooldown_from_row(&row, &record.device_id, record.action)?;

        if current.holds(record.last_fired_at, window) {
            tx.rollback().await?;
            return Ok(CooldownClaim::Held(current));
        }

        sqlx::query(
            r#"
            UPDATE actuator_cooldown
            SET "lastFiredAt" = $3, "lastValue" = $4
            WHERE "deviceId" = $1 AND "actionType" = $2
            "#,
        )
        .bind(&record.device_id)
        .bind(record.action.as_str())
        .bind(record.last_fired_at)
        .bind(record.last_value as i32)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(CooldownClaim::Granted {
            previous: Some(current),
        })
    }

    async fn release_cooldown(
        &self,
        claimed: &CooldownRecord,
        previous: Option<&CooldownRecord>,
    ) -> Result<(), StoreError> {
        match previous {
            Some(record) => {
                sqlx::query(
                    r#"
                    UPDATE actuator_cooldown
                    SET "lastFiredAt" = $5, "lastValue" = $6
                    WHERE "deviceId" = $1 AND "actionType" = $2
                      AND "lastFiredAt" = $3 AND "lastValue" = $4
                    "#,
                )
                .bind(&claimed.device_id)
                .bind(claimed.action.as_str())
                .bind(claimed.last_fired_at)
                .bind(claimed.last_value as i32)
                .bind(record.last_fired_at)
                .bind(record.last_value as i32)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM actuator_cooldown
                    WHERE "deviceId" = $1 AND "actionType" = $2
                      AND "lastFiredAt" = $3 AND "lastValue" = $4
                    "#,
                )
                .bind(&claimed.device_id)
                .bind(claimed.action.as_str())
                .bind(claimed.last_fired_at)
                .bind(claimed.last_value as i32)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for PgStore {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications ("userId", "deviceId", level, title, message, "createdAt")
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(&notification.user_id)
        .bind(&notification.device_id)
        .bind(notification.level.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_millis_round_trip() {
        let at = millis_to_utc(1_714_550_400_000).unwrap();
        assert_eq!(at.timestamp_millis(), 1_714_550_400_000);
        assert!(millis_to_utc(i64::MAX).is_err());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_null_reading_is_zero_and_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let (missing, present) = tracing::subscriber::with_default(subscriber, || {
            (
                reading_or_zero("kit-1", "waterLevel", None),
                reading_or_zero("kit-1", "ph", Some(6.1)),
            )
        });

        assert_eq!(missing, 0.0);
        assert_eq!(present, 6.1);
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.lines().count(), 1);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("kit-1"));
        assert!(logs.contains("waterLevel"));
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        let err = insert_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
    }
}
