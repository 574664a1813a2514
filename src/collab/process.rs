//! Process-backed collaborators.
//!
//! Production deployments drive real subprocesses: an agent CLI per role, a
//! build command, and a test harness that reports per-test results on its
//! output stream. All of them run under a timeout so a wedged subprocess
//! can never wedge the engine.

use crate::collab::{AgentOutcome, AgentRunner, BuildRunner, TestRunner};
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::validation::report::{BuildOutcome, TestOutcome};
use crate::{mlog_debug, mlog_warn};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for agent execution (10 minutes).
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

/// Default timeout for build and test commands (5 minutes).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// How much command output to keep in outcomes and reports.
const OUTPUT_TAIL_BYTES: usize = 4096;

fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_string();
    }
    let start = text.len() - OUTPUT_TAIL_BYTES;
    // Avoid splitting a UTF-8 sequence.
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

async fn run_command(
    program: &Path,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<std::process::Output> {
    mlog_debug!(
        "run_command program={} args={:?} cwd={}",
        program.display(),
        args,
        cwd.display()
    );
    tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| {
        Error::Collaborator(format!(
            "{} timed out after {:?}",
            program.display(),
            timeout
        ))
    })?
    .map_err(Error::Io)
}

/// Runs an agent CLI in headless mode, passing the task as a prompt.
///
/// The agent is expected to make its changes in the working directory and
/// exit zero on success; committing the result is the engine's job.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessAgent {
    /// Create an agent runner, resolving the binary on PATH.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be found.
    pub fn new(program: &str, args: Vec<String>) -> Result<Self> {
        let binary = which::which(program)
            .map_err(|_| Error::Collaborator(format!("agent binary not found: {}", program)))?;
        Ok(Self {
            binary,
            args,
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        })
    }

    /// Create an agent runner with an explicit binary path.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn prompt_for(task: &Task) -> String {
        format!(
            "Role: {}\nSubsystem: {}\nTask: {}\n\n{}",
            task.role, task.subsystem, task.title, task.description
        )
    }
}

#[async_trait]
impl AgentRunner for ProcessAgent {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome> {
        let mut args = self.args.clone();
        args.push(Self::prompt_for(task));

        let output = run_command(&self.binary, &args, workdir, self.timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(AgentOutcome {
                success: true,
                change_set: None,
                diagnostics: tail(stdout.trim()),
            })
        } else {
            let detail = if stderr.trim().is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                tail(stderr.trim())
            };
            mlog_warn!("Agent failed for task {}: {}", task.id.short(), detail);
            Ok(AgentOutcome::failure(detail))
        }
    }
}

/// Runs the configured build command; exit zero means the tree builds.
#[derive(Debug, Clone)]
pub struct ProcessBuildRunner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessBuildRunner {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl BuildRunner for ProcessBuildRunner {
    async fn build(&self, workdir: &Path) -> Result<BuildOutcome> {
        let output = match run_command(&self.program, &self.args, workdir, self.timeout).await {
            Ok(output) => output,
            // A build timeout is a build failure, not an engine error.
            Err(Error::Collaborator(detail)) => return Ok(BuildOutcome::failed(detail)),
            Err(e) => return Err(e),
        };

        if output.status.success() {
            Ok(BuildOutcome::ok())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                tail(stdout.trim())
            } else {
                tail(stderr.trim())
            };
            Ok(BuildOutcome::failed(detail))
        }
    }
}

/// Runs the configured test command and parses per-test result lines.
///
/// The harness reports one line per test on stdout:
///
/// ```text
/// [TEST] name: PASS
/// [TEST] name: FAIL - reason
/// [TEST] name: SKIP
/// ```
#[derive(Debug, Clone)]
pub struct ProcessTestRunner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    line_re: Regex,
}

impl ProcessTestRunner {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            // Static pattern, compiles by construction.
            line_re: Regex::new(
                r"^\[TEST\] (?P<name>[^:]+): (?P<status>PASS|FAIL|SKIP)(?: - (?P<reason>.*))?$",
            )
            .expect("valid result-line pattern"),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse result lines out of harness output; non-matching lines are
    /// harness noise and ignored.
    pub fn parse_results(&self, output: &str) -> Vec<TestOutcome> {
        let mut results = Vec::new();
        for line in output.lines() {
            let Some(caps) = self.line_re.captures(line.trim()) else {
                continue;
            };
            let name = caps["name"].trim().to_string();
            match &caps["status"] {
                "PASS" => results.push(TestOutcome::passed(name)),
                "SKIP" => results.push(TestOutcome::skipped(name)),
                _ => {
                    let reason = caps
                        .name("reason")
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_else(|| "no reason reported".to_string());
                    results.push(TestOutcome::failed(name, reason));
                }
            }
        }
        results
    }
}

#[async_trait]
impl TestRunner for ProcessTestRunner {
    async fn run_tests(&self, workdir: &Path) -> Result<Vec<TestOutcome>> {
        let output = match run_command(&self.program, &self.args, workdir, self.timeout).await {
            Ok(output) => output,
            Err(Error::Collaborator(detail)) => {
                // A hung harness fails the whole suite.
                return Ok(vec![TestOutcome::failed("harness", detail)]);
            }
            Err(e) => return Err(e),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut results = self.parse_results(&stdout);

        if results.is_empty() {
            let detail = if output.status.success() {
                "harness produced no test results".to_string()
            } else {
                tail(String::from_utf8_lossy(&output.stderr).trim())
            };
            results.push(TestOutcome::failed("harness", detail));
        }
        Ok(results)
    }
}
