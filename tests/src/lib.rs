//! Rollout test suites.
//!
//! Meta-package for the cross-crate suites; the scenarios live in `e2e`.

#[cfg(feature = "e2e")]
pub use rollout_e2e_tests as e2e;
