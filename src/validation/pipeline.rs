//! Two-stage validation: build, then tests.
//!
//! The pipeline holds no mutable state; validating the same tree twice with
//! deterministic runners yields the same report. The test stage only runs
//! when the build stage succeeds.

use crate::collab::{BuildRunner, TestRunner};
use crate::error::Result;
use crate::mlog_debug;
use crate::validation::report::{Scope, ValidationReport};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct ValidationPipeline {
    build: Arc<dyn BuildRunner>,
    tests: Arc<dyn TestRunner>,
}

impl ValidationPipeline {
    pub fn new(build: Arc<dyn BuildRunner>, tests: Arc<dyn TestRunner>) -> Self {
        Self { build, tests }
    }

    /// Validate the tree in `workdir` under the given scope.
    ///
    /// A failed build short-circuits: no tests run and the report carries
    /// an empty test list, so the verdict is `BuildFailed`.
    pub async fn validate(&self, scope: Scope, workdir: &Path) -> Result<ValidationReport> {
        mlog_debug!("validate scope={} workdir={}", scope, workdir.display());

        let build = self.build.build(workdir).await?;
        if !build.success {
            return Ok(ValidationReport {
                scope,
                build,
                tests: Vec::new(),
            });
        }

        let tests = self.tests.run_tests(workdir).await?;
        Ok(ValidationReport {
            scope,
            build,
            tests,
        })
    }
}

impl std::fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPipeline").finish()
    }
}
