//! Engine health and readiness

use anyhow::Result;
use colored::Colorize;
use engine_lib::health::{ComponentStatus, HealthResponse, ReadinessResponse};
use serde::Serialize;
use tabled::Tabled;

use crate::client::EngineClient;
use crate::output::{color_status, format_timestamp, print_error, print_json, print_success, OutputFormat};

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    engine_url: &'a str,
    health: &'a HealthResponse,
    readiness: &'a ReadinessResponse,
}

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

fn status_str(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

/// Print engine status; returns whether the engine is ready
pub async fn show_status(client: &EngineClient, format: OutputFormat) -> Result<bool> {
    let health = client.health().await?;
    let readiness = client.readiness().await?;
    let ready = readiness.body.ready;

    match format {
        OutputFormat::Json => print_json(&StatusReport {
            engine_url: client.base_url().as_str(),
            health: &health.body,
            readiness: &readiness.body,
        })?,
        OutputFormat::Table => {
            println!("{}", "Engine Status".bold());
            println!("{}", "=".repeat(50));
            println!("URL:     {}", client.base_url().as_str().cyan());
            println!("Health:  {}", color_status(status_str(health.body.status)));
            println!();

            let mut rows: Vec<ComponentRow> = health
                .body
                .components
                .iter()
                .map(|(name, component)| ComponentRow {
                    name: name.clone(),
                    status: color_status(status_str(component.status)),
                    message: component.message.clone().unwrap_or_default(),
                    last_check: format_timestamp(component.last_check_timestamp),
                })
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));

            if !rows.is_empty() {
                let table = tabled::Table::new(rows)
                    .with(tabled::settings::Style::rounded())
                    .to_string();
                println!("{}", table);
                println!();
            }

            if ready {
                print_success("Engine is ready");
            } else {
                let reason = readiness.body.reason.as_deref().unwrap_or("unknown reason");
                print_error(&format!("Engine is not ready: {}", reason));
            }
        }
    }

    Ok(ready)
}
