//! Actuation decision engine for hydroponic kits
//!
//! This crate provides the core functionality for:
//! - Rule-based dosing decisions with an optional ML predictor
//! - Per-actuator cooldowns with a critical-condition bypass
//! - Durable decision recording
//! - Periodic auto-mode scheduling
//! - Health checks and observability

pub mod clock;
pub mod cooldown;
pub mod engine;
pub mod health;
pub mod models;
pub mod notify;
pub mod observability;
pub mod predictor;
pub mod recorder;
pub mod rules;
pub mod scheduler;
pub mod store;

pub use engine::{
    DecisionEngine, DecisionOutcome, DecisionRequest, DecisionResponse, EngineError,
    ManualOverrides,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use scheduler::{AutoModeScheduler, SchedulerConfig};
