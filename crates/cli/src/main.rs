//! Fountaine operator CLI
//!
//! Inspect the rule cascade offline and check on a running actuation engine.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{explain, status};

/// Fountaine actuation engine CLI
#[derive(Parser)]
#[command(name = "fnt")]
#[command(author, version, about = "CLI for the Fountaine actuation engine", long_about = None)]
pub struct Cli {
    /// Engine URL (falls back to ~/.config/fountaine/config.json, then localhost)
    #[arg(long, env = "FNT_ENGINE_URL")]
    pub engine_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate the rule cascade for a set of readings
    Explain {
        #[arg(long, allow_negative_numbers = true)]
        ph: f64,

        #[arg(long, allow_negative_numbers = true)]
        ppm: f64,

        /// Reservoir level
        #[arg(long, allow_negative_numbers = true)]
        water_level: f64,

        /// Air temperature in °C
        #[arg(long, default_value_t = 0.0)]
        temp: f64,

        #[arg(long, default_value_t = 0.0)]
        humidity: f64,

        #[arg(long, default_value_t = 0.0)]
        water_temp: f64,
    },

    /// Show health and readiness of a running engine
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Explain {
            ph,
            ppm,
            water_level,
            temp,
            humidity,
            water_temp,
        } => {
            let readings = explain::Readings {
                ph,
                ppm,
                water_level,
                temp_c: temp,
                humidity,
                water_temp,
            };
            explain::run(readings, cli.format)?;
        }
        Commands::Status => {
            let engine_url = config::Config::load()?.engine_url(cli.engine_url.as_deref());
            let client = client::EngineClient::new(&engine_url)?;
            if !status::show_status(&client, cli.format).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
