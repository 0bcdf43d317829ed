//! Testing utilities for the rollout workspace engine.
//!
//! Entity builders for event payloads, an [`EngineHarness`] that drives a
//! single workspace on a manual clock, a [`ServerHarness`] running the
//! partition consumer over in-memory backends, recording fakes for the
//! job-agent boundary and assertion helpers.

pub mod assertions;
pub mod builders;
pub mod harness;
pub mod implementations;

pub use builders::{rules, EntityBuilder};
pub use harness::{EngineHarness, ServerHarness, TEST_WORKSPACE};
pub use implementations::{RecordingJobDispatcher, RecordingVerificationRunner};

/// Route test logs through the test writer; safe to call repeatedly
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .with_test_writer()
        .try_init();
}
