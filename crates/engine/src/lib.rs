//! Actuation engine service: configuration and the operational HTTP surface

pub mod api;
pub mod config;
