//! End-to-end scenarios for the workspace engine.
//!
//! Shared topology: system `sys`, job agent `agent`, environment `prod`,
//! deployment `api` and resource `r1`, every selector matching everything.

use rollout_core::ReleaseTarget;
use rollout_test_utils::builders::*;
use rollout_test_utils::EngineHarness;

/// The single release target of [`single_target`]
pub fn api_target() -> ReleaseTarget {
    ReleaseTarget::new("api", "prod", "r1")
}

/// Build the shared topology, optionally with policies created before any
/// version
pub fn single_target(policies: Vec<EntityBuilder>) -> EngineHarness {
    let mut harness = EngineHarness::new();
    harness.create(system("sys"));
    harness.create(job_agent("agent"));
    harness.create(environment("prod", "sys").resource_selector(match_all()));
    harness.create(deployment_with_agent("api", "sys", "agent").resource_selector(match_all()));
    harness.create(resource("r1"));
    for policy in policies {
        harness.create(policy);
    }
    harness
}
