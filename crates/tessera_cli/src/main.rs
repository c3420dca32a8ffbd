//! TESSERA CLI
//!
//! Runs mesh scenarios on an in-process fabric.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Result};
use std::path::PathBuf;
use tessera_mesh::NodeConfig;
use tessera_sim::{Scenario, ScenarioReport, DEMO_NODES};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CRATES: &[&str] = &["tessera_cli", "tessera_fabric", "tessera_mesh", "tessera_sim"];

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "TESSERA - Service discovery and task dispatch mesh", long_about = None)]
struct Cli {
    /// Log level for tessera crates; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the partition-and-heal walkthrough
    Demo {
        /// Number of nodes, at least 3
        #[arg(short, long, default_value_t = DEMO_NODES)]
        nodes: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a scenario file
    Run {
        /// Path to scenario JSON
        #[arg(short, long)]
        scenario: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the demo scenario as JSON
    Scenario {
        /// Number of nodes, at least 3
        #[arg(short, long, default_value_t = DEMO_NODES)]
        nodes: usize,
    },
    /// Print the default node configuration
    Config,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
        EnvFilter::new(directives.join(","))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn demo_size(nodes: usize) -> Result<usize> {
    if nodes < 3 {
        bail!("demo needs at least 3 nodes, got {nodes}");
    }
    Ok(nodes)
}

fn print_report(report: &ScenarioReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json());
    } else {
        print!("{}", report.summary());
    }
    if !report.passed() {
        bail!(
            "scenario {} failed at {} step(s)",
            report.name,
            report.failed_steps().len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    match cli.command {
        Commands::Demo { nodes, json } => {
            info!(nodes, "running demo");
            let report = Scenario::demo(demo_size(nodes)?).run().await?;
            print_report(&report, json)
        }
        Commands::Run { scenario, json } => {
            let scenario = Scenario::load(&scenario)?;
            info!(scenario = %scenario.name, nodes = scenario.nodes.len(), "running scenario");
            let report = scenario.run().await?;
            print_report(&report, json)
        }
        Commands::Scenario { nodes } => {
            println!("{}", Scenario::demo(demo_size(nodes)?).to_json()?);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&NodeConfig::default())?);
            Ok(())
        }
    }
}
