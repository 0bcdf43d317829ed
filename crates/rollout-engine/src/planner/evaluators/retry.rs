use crate::planner::{Decision, WorldView};
use rollout_core::{JobStatus, Policy, PolicyRule, Release};
use std::collections::BTreeSet;

/// Whether another deploy job may be created for a release.
///
/// Without a retry rule every job of the release counts as an attempt and
/// only one is allowed. With retry rules the largest `maxRetries` wins, and
/// only jobs that ended in `failure`, `invalidJobAgent` or one of the
/// `retryOn` statuses consume an attempt. Rollback jobs never count.
pub fn evaluate(world: &WorldView<'_>, policies: &[&Policy], release: &Release) -> Decision {
    let rules: Vec<_> = policies
        .iter()
        .flat_map(|policy| policy.rules.iter())
        .filter_map(|rule| match rule {
            PolicyRule::Retry(rule) => Some(rule),
            _ => None,
        })
        .collect();

    let jobs: Vec<_> = world
        .jobs
        .jobs_for_release(world.stores, &release.id)
        .into_iter()
        .filter(|job| !job.is_rollback())
        .collect();

    if rules.is_empty() {
        return if jobs.is_empty() {
            Decision::allow()
        } else {
            Decision::deny("release already attempted")
        };
    }

    let max_retries = rules.iter().map(|rule| rule.max_retries).max().unwrap_or(0);
    let mut consuming: BTreeSet<JobStatus> = [JobStatus::Failure, JobStatus::InvalidJobAgent].into_iter().collect();
    for rule in &rules {
        consuming.extend(rule.retry_on.iter().flatten().copied());
    }

    let attempts = jobs.iter().filter(|job| consuming.contains(&job.status)).count();
    let allowed = max_retries as usize + 1;
    if attempts < allowed {
        Decision::allow_by(format!("attempt {} of {}", attempts + 1, allowed))
    } else {
        Decision::deny(format!("retries exhausted after {} attempts", attempts))
    }
}
