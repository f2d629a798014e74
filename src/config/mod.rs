//! Process configuration
//!
//! Deployment-level settings come from environment variables; behavioural
//! tunables (timeouts, pacing, caps) are constants owned by the modules that
//! apply them.

pub mod types;

pub use types::HarvesterConfig;
