//! Validation: build/test pipeline, reports, and composition analysis.

pub mod composition;
pub mod pipeline;
pub mod report;

pub use composition::{CompositionFinding, CompositionValidator, IntegrationProber, Severity};
pub use pipeline::ValidationPipeline;
pub use report::{BuildOutcome, Scope, TestOutcome, TestStatus, ValidationReport, Verdict};
