//! # emthreads-harness
//!
//! Conformance scenarios for the emthreads threading layer. Each scenario is
//! a self-contained program in the style of a classic threading-library test
//! suite: it builds a fresh runtime on the host OSAL, drives one behavioral
//! contract end to end (timeout accounting, cancel-during-wait, cleanup
//! ordering, handle reuse), and reports pass/fail with a diagnostic string.
//!
//! The `harness` binary lists and runs scenarios and can emit a JSON report.

pub mod report;
pub mod scenarios;

use std::time::Instant;

use emthreads_osal::HostOsalConfig;

use crate::report::{RunReport, ScenarioOutcome};
use crate::scenarios::Scenario;

/// Errors of the harness itself, as opposed to scenario failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("no scenario named `{0}`")]
    UnknownScenario(String),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("report i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the selected scenarios (all of them when `only` is `None`) and
/// collects a report.
pub fn run_scenarios(
    campaign: impl Into<String>,
    only: Option<&str>,
    config: &HostOsalConfig,
) -> Result<RunReport, HarnessError> {
    let selected: Vec<&Scenario> = match only {
        Some(name) => {
            let scenario = scenarios::all()
                .iter()
                .find(|scenario| scenario.name == name)
                .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))?;
            vec![scenario]
        }
        None => scenarios::all().iter().collect(),
    };

    let mut outcomes = Vec::with_capacity(selected.len());
    for scenario in selected {
        let started = Instant::now();
        let result = (scenario.run)(config);
        outcomes.push(ScenarioOutcome {
            name: scenario.name.to_string(),
            passed: result.is_ok(),
            duration_ms: started.elapsed().as_millis(),
            detail: result.err(),
        });
    }

    Ok(RunReport::new(campaign, config, outcomes))
}
