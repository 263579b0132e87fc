//! Run reports: per-scenario outcomes plus campaign metadata, serializable
//! for archiving alongside CI logs.

use emthreads_osal::HostOsalConfig;
use serde::Serialize;

/// Result of one scenario execution.
#[derive(Debug, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u128,
    /// Failure diagnostic; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A full harness run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub campaign: String,
    /// Cancellation poll slice the run was configured with, in microseconds.
    pub poll_interval_us: u128,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub scenarios: Vec<ScenarioOutcome>,
}

impl RunReport {
    #[must_use]
    pub fn new(
        campaign: impl Into<String>,
        config: &HostOsalConfig,
        scenarios: Vec<ScenarioOutcome>,
    ) -> Self {
        let passed = scenarios.iter().filter(|outcome| outcome.passed).count();
        Self {
            campaign: campaign.into(),
            poll_interval_us: config.poll_interval.as_micros(),
            total: scenarios.len(),
            passed,
            failed: scenarios.len() - passed,
            scenarios,
        }
    }

    /// True when every scenario passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, passed: bool) -> ScenarioOutcome {
        ScenarioOutcome {
            name: name.to_string(),
            passed,
            duration_ms: 1,
            detail: (!passed).then(|| "expected 3, saw 2".to_string()),
        }
    }

    #[test]
    fn totals_are_derived_from_outcomes() {
        let report = RunReport::new(
            "smoke",
            &HostOsalConfig::default(),
            vec![outcome("a", true), outcome("b", false), outcome("c", true)],
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.all_passed());
    }

    #[test]
    fn json_report_carries_failure_detail() {
        let report = RunReport::new(
            "smoke",
            &HostOsalConfig::default(),
            vec![outcome("a", false)],
        );
        let json = report.to_json().expect("serialize");
        assert!(json.contains("\"campaign\": \"smoke\""));
        assert!(json.contains("expected 3, saw 2"));
    }

    #[test]
    fn successful_outcomes_omit_detail() {
        let report = RunReport::new("smoke", &HostOsalConfig::default(), vec![outcome("a", true)]);
        let json = report.to_json().expect("serialize");
        assert!(!json.contains("detail"));
        assert!(report.all_passed());
    }
}
