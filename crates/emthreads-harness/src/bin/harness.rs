//! CLI entrypoint for the emthreads conformance harness.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use emthreads_harness::{run_scenarios, scenarios};
use emthreads_osal::HostOsalConfig;

/// Conformance tooling for the emthreads threading layer.
#[derive(Debug, Parser)]
#[command(name = "emthreads-harness")]
#[command(about = "Conformance scenario harness for emthreads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available scenarios.
    List,
    /// Run scenarios and report pass/fail.
    Run {
        /// Run only the named scenario instead of all of them.
        #[arg(long)]
        scenario: Option<String>,
        /// Write a JSON report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Cancellation poll slice in microseconds.
        #[arg(long, default_value_t = 100)]
        poll_interval_us: u64,
        /// Campaign label recorded in the report.
        #[arg(long, default_value = "conformance")]
        campaign: String,
    },
}

fn main() -> ExitCode {
    match Cli::parse().command {
        Command::List => {
            for scenario in scenarios::all() {
                println!("{:<26} {}", scenario.name, scenario.summary);
            }
            ExitCode::SUCCESS
        }
        Command::Run {
            scenario,
            report,
            poll_interval_us,
            campaign,
        } => {
            let config = HostOsalConfig {
                poll_interval: Duration::from_micros(poll_interval_us),
                ..HostOsalConfig::default()
            };

            let run = match run_scenarios(campaign, scenario.as_deref(), &config) {
                Ok(run) => run,
                Err(err) => {
                    eprintln!("harness error: {err}");
                    return ExitCode::FAILURE;
                }
            };

            for outcome in &run.scenarios {
                let status = if outcome.passed { "pass" } else { "FAIL" };
                match &outcome.detail {
                    Some(detail) => {
                        println!("{status}  {:<26} {}ms  {detail}", outcome.name, outcome.duration_ms);
                    }
                    None => println!("{status}  {:<26} {}ms", outcome.name, outcome.duration_ms),
                }
            }
            println!("{}/{} passed", run.passed, run.total);

            if let Some(path) = report {
                let json = match run.to_json() {
                    Ok(json) => json,
                    Err(err) => {
                        eprintln!("harness error: {err}");
                        return ExitCode::FAILURE;
                    }
                };
                if let Err(err) = std::fs::write(&path, json) {
                    eprintln!("harness error: {err}");
                    return ExitCode::FAILURE;
                }
            }

            if run.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
