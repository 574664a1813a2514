//! Integration test suite for Maestro.
//!
//! These tests drive the full orchestration loop against temporary git
//! repositories, with scripted agents standing in for real collaborator
//! processes and stub runners standing in for real build and test commands.
//!
//! # Test Categories
//!
//! - `run_e2e`: Full runs over dependency graphs, landing on integration
//! - `composition_detection`: Cross-subsystem failures, bisection, reopen
//! - `budgets_and_deadlock`: Retry, cost, round budgets and stall handling
//!
//! # CI Compatibility
//!
//! No external binaries are spawned; everything runs in-process against
//! temp directories, making the suite safe for CI environments.

mod fixtures;

mod run_e2e;
mod composition_detection;
