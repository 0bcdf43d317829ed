use crate::planner::{Decision, WorldView};
use chrono::Duration;
use rollout_core::{DeploymentWindowRule, RecurrenceRule, ReleaseTarget};

/// Gate deployments on a recurring window.
///
/// Allow windows admit deployments inside an occurrence and defer the rest
/// to the next occurrence start; a target that has never had a successful
/// release is exempt. Deny windows defer deployments inside an occurrence to
/// its end.
pub fn evaluate(world: &WorldView<'_>, rule: &DeploymentWindowRule, target: &ReleaseTarget) -> Decision {
    let recurrence = match RecurrenceRule::parse(&rule.rrule) {
        Ok(recurrence) => recurrence,
        Err(e) => return Decision::deny(format!("invalid deployment window: {}", e)),
    };
    let duration = Duration::minutes(i64::from(rule.duration_minutes));
    let occurrence = recurrence.occurrence_containing(world.now, duration);

    if !rule.allow {
        return match occurrence {
            Some(occurrence) => Decision::defer(occurrence.end, "inside deny window"),
            None => Decision::allow(),
        };
    }

    if occurrence.is_some() {
        return Decision::allow_by("inside deployment window");
    }
    if !world.jobs.has_successful_release(world.stores, &target.key()) {
        return Decision::allow_by("first deployment");
    }
    match recurrence.next_start_after(world.now) {
        Some(next) => Decision::defer(next, "outside deployment window"),
        None => Decision::deny("deployment window has no further occurrences"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::evaluators::fixtures::{target, World};
    use chrono::{TimeZone, Utc};
    use rollout_core::JobStatus;

    fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap()
    }

    fn nine_to_ten(allow: bool) -> DeploymentWindowRule {
        DeploymentWindowRule {
            rrule: "FREQ=DAILY;BYHOUR=9;BYMINUTE=0".into(),
            duration_minutes: 60,
            allow,
        }
    }

    #[test]
    fn test_allow_window() {
        let mut world = World::new();
        let tgt = target("api", "r1");
        let v1 = world.version("api", "v1", at(0, 0));
        world.deployed(&tgt, &v1, JobStatus::Successful, at(1, 0));
        let rule = nine_to_ten(true);

        assert!(evaluate(&world.view(at(9, 30)), &rule, &tgt).is_allow());
        assert_eq!(
            evaluate(&world.view(at(8, 0)), &rule, &tgt),
            Decision::defer(at(9, 0), "outside deployment window")
        );
        assert_eq!(
            evaluate(&world.view(at(10, 0)), &rule, &tgt),
            Decision::defer(at(9, 0) + Duration::days(1), "outside deployment window")
        );
    }

    #[test]
    fn test_first_deployment_ignores_allow_window() {
        let world = World::new();
        assert!(evaluate(&world.view(at(8, 0)), &nine_to_ten(true), &target("api", "r1")).is_allow());
    }

    #[test]
    fn test_deny_window_defers_to_end() {
        let world = World::new();
        let tgt = target("api", "r1");
        let rule = nine_to_ten(false);

        assert_eq!(
            evaluate(&world.view(at(9, 15)), &rule, &tgt),
            Decision::defer(at(10, 0), "inside deny window")
        );
        assert!(evaluate(&world.view(at(10, 0)), &rule, &tgt).is_allow());
    }

    #[test]
    fn test_invalid_rule_denies() {
        let world = World::new();
        let rule = DeploymentWindowRule { rrule: "FREQ=SOMETIMES".into(), duration_minutes: 60, allow: true };
        assert!(matches!(evaluate(&world.view(at(9, 0)), &rule, &target("api", "r1")), Decision::Deny { .. }));
    }
}
