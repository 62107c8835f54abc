//! Auto-mode scheduler
//!
//! Every tick reads the devices with auto mode switched on, runs the
//! decision pipeline for each and notifies the owner. A device that fails
//! is logged and skipped; the rest of the tick carries on.

use crate::engine::{DecisionEngine, DecisionOutcome, DecisionRequest, EngineError};
use crate::health::components;
use crate::models::AutoModeRegistration;
use crate::notify::{Notification, Notifier};
use crate::store::DeviceRegistry;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Devices processed in parallel within one tick
    pub device_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            device_concurrency: 1,
        }
    }
}

/// Time left until the next tick should start, so ticks stay on a fixed
/// cadence. A tick that overran its interval is followed immediately.
pub fn next_pause(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// Summary of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub devices: usize,
    pub decided: usize,
    pub failed: usize,
}

pub struct AutoModeScheduler {
    engine: Arc<DecisionEngine>,
    registry: Arc<dyn DeviceRegistry>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
}

impl AutoModeScheduler {
    pub fn new(
        engine: Arc<DecisionEngine>,
        registry: Arc<dyn DeviceRegistry>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            notifier,
            config,
            state: RwLock::new(SchedulerState::Running),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Tick until shutdown. A tick in progress always completes.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            concurrency = self.config.device_concurrency,
            "Starting auto-mode scheduler"
        );
        self.engine.health().set_healthy(components::SCHEDULER).await;

        loop {
            let started = Instant::now();
            let report = self.run_tick().await;
            debug!(
                devices = report.devices,
                decided = report.decided,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Auto-mode tick complete"
            );

            let pause = next_pause(self.config.tick_interval, started.elapsed());
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down auto-mode scheduler");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        *self.state.write().await = SchedulerState::Stopped;
        self.engine
            .health()
            .set_degraded(components::SCHEDULER, "stopped")
            .await;
    }

    /// Process every auto-mode device once
    pub async fn run_tick(&self) -> TickReport {
        let metrics = self.engine.metrics();
        metrics.inc_scheduler_ticks();

        let registrations = match self.registry.auto_enabled().await {
            Ok(registrations) => registrations,
            Err(e) => {
                error!(error = %e, "Failed to read auto-mode registrations");
                self.engine
                    .health()
                    .set_degraded(components::SCHEDULER, e.to_string())
                    .await;
                return TickReport::default();
            }
        };
        metrics.set_auto_devices(registrations.len() as i64);

        if registrations.is_empty() {
            return TickReport::default();
        }
        info!(devices = registrations.len(), "Triggering auto mode");

        let decided = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let devices = registrations.len();

        stream::iter(registrations)
            .for_each_concurrent(self.config.device_concurrency.max(1), |registration| {
                let decided = &decided;
                let failed = &failed;
                async move {
                    match self.process_device(&registration).await {
                        Ok(_) => {
                            decided.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            self.engine.metrics().inc_device_failures();
                            error!(
                                device_id = %registration.device_id,
                                error = %e,
                                "Auto-mode decision failed"
                            );
                        }
                    }
                }
            })
            .await;

        self.engine.health().set_healthy(components::SCHEDULER).await;

        TickReport {
            devices,
            decided: decided.into_inner(),
            failed: failed.into_inner(),
        }
    }

    async fn process_device(
        &self,
        registration: &AutoModeRegistration,
    ) -> Result<DecisionOutcome, EngineError> {
        let request = DecisionRequest::auto(registration.device_id.as_str())
            .requested_by(registration.user_id.as_str());
        let outcome = self.engine.invoke(request).await?;

        info!(
            device_id = %outcome.device_id,
            decision_id = outcome.decision_id,
            ph_up = outcome.actions.ph_up(),
            ph_down = outcome.actions.ph_down(),
            nutrient_add = outcome.actions.nutrient_add(),
            refill = outcome.actions.refill(),
            "Auto adjustment applied"
        );

        let user_id = registration.user_id.trim();
        if !user_id.is_empty() {
            let notification = Notification::auto_mode(user_id, &outcome);
            if let Err(e) = self.notifier.notify(&notification).await {
                warn!(
                    device_id = %outcome.device_id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to create notification"
                );
            }
        }

        Ok(outcome)
    }
}
