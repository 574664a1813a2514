//! Validation report types.
//!
//! A report is a pure value: what was validated (scope), whether it built,
//! and what the tests said. Reports are compared by the composition
//! validator and persisted in run snapshots, so everything here is
//! serializable and side-effect free.

use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};

/// What a validation run covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// One task's change set validated on its own branch.
    Isolated {
        task: TaskId,
        change_set: Option<String>,
    },
    /// The integration branch with changes from the named subsystems.
    Integrated { subsystems: Vec<String> },
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Isolated { task, .. } => write!(f, "isolated({})", task.short()),
            Scope::Integrated { subsystems } => {
                write!(f, "integrated({})", subsystems.join("+"))
            }
        }
    }
}

/// Result of the build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub success: bool,
    /// Tail of the build output, kept for failure reports.
    pub output: String,
}

impl BuildOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            output: String::new(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Status of one named test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Not run, e.g. because the build stage failed.
    Skipped,
}

/// One test's outcome with whatever evidence the runner captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
    /// Failure reason or other runner-provided detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl TestOutcome {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Passed,
            evidence: None,
        }
    }

    pub fn failed(name: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Failed,
            evidence: Some(evidence.into()),
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Skipped,
            evidence: None,
        }
    }
}

/// Overall verdict of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    BuildFailed,
    TestsFailed,
}

/// The full result of validating one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub scope: Scope,
    pub build: BuildOutcome,
    pub tests: Vec<TestOutcome>,
}

impl ValidationReport {
    pub fn verdict(&self) -> Verdict {
        if !self.build.success {
            return Verdict::BuildFailed;
        }
        if self.tests.iter().any(|t| t.status == TestStatus::Failed) {
            return Verdict::TestsFailed;
        }
        Verdict::Passed
    }

    pub fn passed(&self) -> bool {
        self.verdict() == Verdict::Passed
    }

    /// Names of tests that failed in this run.
    pub fn failed_tests(&self) -> Vec<&str> {
        self.tests
            .iter()
            .filter(|t| t.status == TestStatus::Failed)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// One-line summary for logs and reopen reasons.
    pub fn summary(&self) -> String {
        match self.verdict() {
            Verdict::Passed => format!("{}: passed ({} tests)", self.scope, self.tests.len()),
            Verdict::BuildFailed => format!("{}: build failed", self.scope),
            Verdict::TestsFailed => {
                let failed = self.failed_tests();
                format!(
                    "{}: {} of {} tests failed ({})",
                    self.scope,
                    failed.len(),
                    self.tests.len(),
                    failed.join(", ")
                )
            }
        }
    }
}
