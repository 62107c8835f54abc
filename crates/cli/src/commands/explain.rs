//! Offline evaluation of the rule cascade

use anyhow::Result;
use colored::Colorize;
use engine_lib::cooldown::{CriticalCondition, CriticalThresholds};
use engine_lib::models::{ActionSet, ActionType, TelemetrySnapshot};
use engine_lib::rules::{RuleEngine, Tier, TierTrace};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{color_status, format_secs, print_json, print_success, print_warning, OutputFormat};

/// Readings supplied on the command line
#[derive(Debug, Clone, Copy)]
pub struct Readings {
    pub ph: f64,
    pub ppm: f64,
    pub water_level: f64,
    pub temp_c: f64,
    pub humidity: f64,
    pub water_temp: f64,
}

impl Readings {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            ph: self.ph,
            ppm: self.ppm,
            water_level: self.water_level,
            temp_c: self.temp_c,
            humidity: self.humidity,
            water_temp: self.water_temp,
            ..TelemetrySnapshot::zeroed("cli", chrono::Utc::now())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainReport {
    pub tiers: Vec<TierTrace>,
    pub fired: Tier,
    pub actions: ActionSet,
    /// Conditions under which the cooldown guard would be bypassed
    pub critical: Vec<CriticalCondition>,
}

impl ExplainReport {
    pub fn bypasses_cooldown(&self) -> bool {
        !self.critical.is_empty()
    }
}

pub fn evaluate(readings: &Readings) -> ExplainReport {
    let snapshot = readings.snapshot();
    let rules = RuleEngine::default();
    let outcome = rules.evaluate(&snapshot);

    ExplainReport {
        tiers: rules.explain(&snapshot),
        fired: outcome.tier,
        actions: outcome.actions,
        critical: CriticalThresholds::default().breaches(&snapshot),
    }
}

#[derive(Tabled)]
struct TierRow {
    #[tabled(rename = "#")]
    rank: u8,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Verdict")]
    verdict: String,
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Max")]
    max: String,
}

pub fn run(readings: Readings, format: OutputFormat) -> Result<()> {
    let report = evaluate(&readings);

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Rule Cascade".bold());
            println!("{}", "=".repeat(50));
            println!(
                "pH {}  ppm {}  water level {}",
                readings.ph.to_string().cyan(),
                readings.ppm.to_string().cyan(),
                readings.water_level.to_string().cyan()
            );
            println!();

            let rows: Vec<TierRow> = report
                .tiers
                .iter()
                .map(|trace| TierRow {
                    rank: trace.tier.rank(),
                    tier: trace.tier.to_string(),
                    verdict: color_status(trace.verdict.as_str()),
                })
                .collect();
            println!(
                "{}",
                tabled::Table::new(rows).with(tabled::settings::Style::rounded()).to_string()
            );

            println!();
            let rows: Vec<ActionRow> = ActionType::ALL
                .iter()
                .map(|action| ActionRow {
                    action: action.label().to_string(),
                    duration: format_secs(report.actions.get(*action)),
                    max: format_secs(action.max_secs()),
                })
                .collect();
            println!(
                "{}",
                tabled::Table::new(rows).with(tabled::settings::Style::rounded()).to_string()
            );

            println!();
            if report.actions.is_idle() {
                print_success("All parameters within safe limits");
            } else {
                println!("{} {}", "Proposed:".bold(), report.actions.summary());
            }

            if report.bypasses_cooldown() {
                let conditions = report
                    .critical
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                print_warning(&format!(
                    "Critical readings ({}), cooldown would be bypassed",
                    color_status("critical")
                ));
                println!("  {}", conditions);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_lib::rules::TierVerdict;

    fn readings(ph: f64, ppm: f64, water_level: f64) -> Readings {
        Readings {
            ph,
            ppm,
            water_level,
            temp_c: 24.0,
            humidity: 60.0,
            water_temp: 21.0,
        }
    }

    #[test]
    fn test_acid_reading_fires_third_tier() {
        let report = evaluate(&readings(5.0, 700.0, 2.0));

        assert_eq!(report.fired, Tier::AcidityCorrection);
        assert_eq!(report.actions.ph_up(), 4);
        assert!(!report.bypasses_cooldown());

        let verdicts: Vec<TierVerdict> = report.tiers.iter().map(|t| t.verdict).collect();
        assert_eq!(
            verdicts,
            vec![
                TierVerdict::Passed,
                TierVerdict::Passed,
                TierVerdict::Fired,
                TierVerdict::Skipped,
                TierVerdict::Skipped,
            ]
        );
    }

    #[test]
    fn test_low_water_is_critical() {
        let report = evaluate(&readings(6.0, 700.0, 0.9));

        assert_eq!(report.fired, Tier::CriticalWaterLevel);
        assert_eq!(report.actions.refill(), 6);
        assert_eq!(report.critical, vec![CriticalCondition::WaterLevelLow]);
    }

    #[test]
    fn test_report_json_shape() {
        let report = evaluate(&readings(6.0, 700.0, 2.0));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["fired"], "micro-adjustment");
        assert_eq!(json["tiers"].as_array().unwrap().len(), 5);
        assert_eq!(json["actions"]["source"], "rule");
        assert!(json["critical"].as_array().unwrap().is_empty());
    }
}
