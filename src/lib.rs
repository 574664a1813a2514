pub mod collab;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod validation;

pub use collab::RepoOps;
pub use config::Config;
pub use error::{Error, GraphError, Result};
