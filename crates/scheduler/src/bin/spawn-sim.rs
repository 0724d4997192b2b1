//! spawn-sim: host stand-in for the software SIMT device.
//!
//! Subcommands:
//! - `plan`: print the launch plan and every core's assignment as JSON
//! - `run`: execute a coverage kernel and check every index ran once
//! - `matmul`: square matrix multiply verified against a host reference
//! - `conform`: lane-control conformance checks

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use warpspawn_core::config::load_dotenv;
use warpspawn_core::{DeviceConfig, Dim3};
use warpspawn_scheduler::conform;
use warpspawn_scheduler::kernels::{run_matmul, CoverageKernel};
use warpspawn_scheduler::{LaunchPlan, SoftDevice};

// ── CLI ─────────────────────────────────────────────────────────────

/// Software SIMT device: plan, run and verify kernel launches.
#[derive(Parser, Debug)]
#[command(name = "spawn-sim", version, about)]
struct Cli {
    /// Path to a device TOML config file.
    #[arg(long, env = "WARPSPAWN_CONFIG")]
    config: Option<String>,

    /// Override the core count.
    #[arg(long)]
    cores: Option<u32>,

    /// Override the resident warps per core.
    #[arg(long)]
    warps: Option<u32>,

    /// Override the lanes per warp.
    #[arg(long)]
    threads: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the launch plan without running anything.
    Plan {
        /// Grid extent, e.g. `8`, `4,2` or `4x2x2`.
        #[arg(long)]
        grid: Dim3,
        /// Group extent; defaults to a single lane.
        #[arg(long, default_value = "1")]
        block: Dim3,
    },
    /// Run a coverage kernel and verify each index executed exactly once.
    Run {
        #[arg(long)]
        grid: Dim3,
        #[arg(long, default_value = "1")]
        block: Dim3,
    },
    /// Square matrix multiply, one lane per output element.
    Matmul {
        #[arg(long)]
        size: u32,
        /// Tile edge; 1 launches flat tasks, larger values launch groups.
        #[arg(long, default_value_t = 1)]
        tile: u32,
    },
    /// Run the lane-control conformance checks.
    Conform,
}

// ── config ──────────────────────────────────────────────────────────

fn resolve_config(cli: &Cli) -> anyhow::Result<DeviceConfig> {
    let mut config = match &cli.config {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("failed to load device config from {path}"))?,
        None => DeviceConfig::from_env(),
    };
    if let Some(cores) = cli.cores {
        config.device.cores = cores;
    }
    if let Some(warps) = cli.warps {
        config.device.warps_per_core = warps;
    }
    if let Some(threads) = cli.threads {
        config.device.lanes_per_warp = threads;
    }
    config.validate().context("invalid device configuration")?;
    Ok(config)
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    config.log_summary();

    match cli.command {
        Command::Plan { grid, block } => {
            let plan = LaunchPlan::new(grid, block, config.capacity()?)?;
            let out = json!({
                "device": config.summary(),
                "plan": plan,
                "cores": plan.assignments(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Run { grid, block } => {
            let mut device = SoftDevice::from_config(&config)?;
            let kernel = CoverageKernel::new(grid, block);
            let report = device.launch(grid, block, &kernel)?;
            let coverage = kernel.summary();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "report": report, "coverage": coverage }))?
            );
            if !coverage.is_exact() {
                bail!(
                    "coverage mismatch: {} missed, {} repeated",
                    coverage.missed,
                    coverage.repeated
                );
            }
        }
        Command::Matmul { size, tile } => {
            let mut device = SoftDevice::from_config(&config)?;
            let outcome = run_matmul(&mut device, size, tile)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.passed() {
                bail!("matmul produced {} wrong elements", outcome.errors);
            }
            info!("PASSED!");
        }
        Command::Conform => {
            let mut device = SoftDevice::from_config(&config)?;
            let outcomes = conform::run_all(&mut device)?;
            for o in &outcomes {
                let status = if o.passed() { "PASS" } else { "FAIL" };
                println!("{:<12} {}", o.name, status);
            }
            conform::ensure_passed(&outcomes)?;
        }
    }

    Ok(())
}
