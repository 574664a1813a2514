//! Composition failure detection.
//!
//! The failure mode this catches: every task passes validation on its own
//! branch, yet the integrated tree fails. No single task is wrong; the
//! assembly is. The validator keeps the isolated report for each changed
//! subsystem, and when an integration run fails while all isolated runs
//! passed, it narrows the failure to a minimal prefix of the integration
//! order by bisection, spending at most a configured number of probe
//! builds.

use crate::core::task::TaskId;
use crate::error::Result;
use crate::validation::report::{TestStatus, ValidationReport};
use crate::{mlog, mlog_debug};
use async_trait::async_trait;
use std::collections::HashMap;

/// Runs a validation over an integration containing only the named
/// subsystems' changes. Implemented by the engine (merging the relevant
/// branches into a probe branch) and by stubs in tests.
#[async_trait]
pub trait IntegrationProber: Send + Sync {
    async fn probe(&self, subsystems: &[String]) -> Result<ValidationReport>;
}

/// How sure the validator is about the implicated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Bisection converged on a minimal failing prefix.
    Confirmed,
    /// Probe budget ran out; the implicated set is an over-approximation.
    UnresolvedBisection,
}

/// One detected composition failure.
#[derive(Debug, Clone)]
pub struct CompositionFinding {
    /// Subsystems in the minimal failing prefix, in integration order.
    pub subsystems: Vec<String>,
    /// The last subsystem of the prefix: adding it made integration fail.
    pub trigger: String,
    /// Tasks whose changes land in the implicated subsystems.
    pub implicated_tasks: Vec<TaskId>,
    /// Summaries of the (passing) isolated reports, for the record.
    pub isolated: Vec<String>,
    /// Summary of the failing integrated report.
    pub integrated: String,
    /// Tests that passed in every isolated run but failed integrated.
    pub regressed_tests: Vec<String>,
    pub severity: Severity,
    /// Probe validations spent during bisection.
    pub probes_used: u32,
}

impl CompositionFinding {
    /// Reason string recorded on reopened tasks.
    pub fn reopen_reason(&self) -> String {
        let mut reason = format!(
            "composition failure across [{}], triggered by {}: {}",
            self.subsystems.join(", "),
            self.trigger,
            self.integrated
        );
        if !self.regressed_tests.is_empty() {
            reason.push_str(&format!(
                "; regressed tests: {}",
                self.regressed_tests.join(", ")
            ));
        }
        reason
    }
}

/// Tracks isolated validation results and diagnoses integration failures.
pub struct CompositionValidator {
    /// Latest isolated report per subsystem.
    isolated: HashMap<String, ValidationReport>,
    /// Tasks that contributed changes, per subsystem.
    contributors: HashMap<String, Vec<TaskId>>,
    /// Integration order of changed subsystems.
    order: Vec<String>,
    bisection_budget: u32,
}

impl CompositionValidator {
    pub fn new(bisection_budget: u32) -> Self {
        Self {
            isolated: HashMap::new(),
            contributors: HashMap::new(),
            order: Vec::new(),
            bisection_budget,
        }
    }

    /// Record the isolated report for a task's change to a subsystem.
    ///
    /// Later records for the same subsystem replace the report (the latest
    /// change is what integration sees) and append the contributor.
    pub fn record_isolated(&mut self, subsystem: &str, task: TaskId, report: ValidationReport) {
        if !self.order.iter().any(|s| s == subsystem) {
            self.order.push(subsystem.to_string());
        }
        self.isolated.insert(subsystem.to_string(), report);
        self.contributors
            .entry(subsystem.to_string())
            .or_default()
            .push(task);
    }

    /// Changed subsystems in integration order.
    pub fn changed_subsystems(&self) -> &[String] {
        &self.order
    }

    pub fn contributors(&self, subsystem: &str) -> &[TaskId] {
        self.contributors
            .get(subsystem)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Forget the given subsystems; called after their tasks are reopened
    /// so the re-landed changes get fresh isolated records.
    pub fn reset(&mut self, subsystems: &[String]) {
        for s in subsystems {
            self.isolated.remove(s);
            self.contributors.remove(s);
        }
        self.order.retain(|s| !subsystems.contains(s));
    }

    /// Diagnose a failed integration report.
    ///
    /// Returns a finding only when the failure is a composition effect:
    /// the integration failed while every changed subsystem's isolated
    /// report passed. An isolated failure is an ordinary task failure and
    /// yields `None`. At most one finding is produced per call.
    pub async fn analyze(
        &self,
        integrated: &ValidationReport,
        prober: &dyn IntegrationProber,
    ) -> Result<Option<CompositionFinding>> {
        if integrated.passed() {
            return Ok(None);
        }
        if self.order.is_empty() {
            return Ok(None);
        }
        // If any isolated run failed, the blame lies with that task.
        if self.order.iter().any(|s| {
            self.isolated
                .get(s)
                .map(|r| !r.passed())
                .unwrap_or(true)
        }) {
            return Ok(None);
        }

        mlog!(
            "Composition failure suspected: {} passed isolation, integration failed",
            self.order.join("+")
        );

        let (prefix_len, probes_used, converged) = self.bisect(prober).await?;
        let subsystems: Vec<String> = self.order[..prefix_len].to_vec();
        let trigger = subsystems
            .last()
            .cloned()
            .unwrap_or_default();
        let implicated_tasks = subsystems
            .iter()
            .flat_map(|s| self.contributors(s).iter().copied())
            .collect();
        let isolated = subsystems
            .iter()
            .filter_map(|s| self.isolated.get(s))
            .map(|r| r.summary())
            .collect();

        Ok(Some(CompositionFinding {
            subsystems,
            trigger,
            implicated_tasks,
            isolated,
            integrated: integrated.summary(),
            regressed_tests: self.regressed_tests(integrated),
            severity: if converged {
                Severity::Confirmed
            } else {
                Severity::UnresolvedBisection
            },
            probes_used,
        }))
    }

    /// Integrated test failures no isolated run saw fail: these tests held
    /// in every task's own tree and broke only in the assembly.
    fn regressed_tests(&self, integrated: &ValidationReport) -> Vec<String> {
        integrated
            .failed_tests()
            .into_iter()
            .filter(|name| {
                self.isolated.values().all(|report| {
                    report
                        .tests
                        .iter()
                        .filter(|t| t.name == *name)
                        .all(|t| t.status == TestStatus::Passed)
                })
            })
            .map(str::to_string)
            .collect()
    }

    /// Find the shortest failing prefix of the integration order.
    ///
    /// Invariant: the empty prefix passes (it is the base tree) and the
    /// full prefix fails (the integration run that triggered analysis).
    /// Binary search keeps `lo` passing and `hi` failing, so it needs
    /// at most log2(k) probes for k changed subsystems.
    ///
    /// Returns (prefix length, probes used, whether the search converged).
    async fn bisect(&self, prober: &dyn IntegrationProber) -> Result<(usize, u32, bool)> {
        let k = self.order.len();
        let mut lo = 0usize;
        let mut hi = k;
        let mut probes = 0u32;

        while hi - lo > 1 {
            if probes >= self.bisection_budget {
                mlog_debug!(
                    "bisection budget exhausted at lo={} hi={} after {} probes",
                    lo,
                    hi,
                    probes
                );
                return Ok((hi, probes, false));
            }
            let mid = lo + (hi - lo) / 2;
            let report = prober.probe(&self.order[..mid]).await?;
            probes += 1;
            mlog_debug!(
                "bisection probe prefix_len={} verdict={:?}",
                mid,
                report.verdict()
            );
            if report.passed() {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok((hi, probes, true))
    }
}

impl std::fmt::Debug for CompositionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositionValidator")
            .field("subsystems", &self.order)
            .field("bisection_budget", &self.bisection_budget)
            .finish()
    }
}
