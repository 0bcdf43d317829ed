use crate::state::Stores;
use rollout_core::{Job, JobStatus, Release};
use std::collections::{BTreeMap, BTreeSet};

/// Secondary indexes from release targets to releases and from releases to
/// jobs. Releases and jobs are never deleted, so entries only grow.
#[derive(Debug, Clone, Default)]
pub struct JobIndex {
    releases_by_target: BTreeMap<String, BTreeSet<String>>,
    jobs_by_release: BTreeMap<String, BTreeSet<String>>,
}

impl JobIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the stores
    pub fn rebuild(stores: &Stores) -> Self {
        let mut index = Self::new();
        for release in stores.releases.values() {
            index.add_release(release);
        }
        for job in stores.jobs.values() {
            index.add_job(job);
        }
        index
    }

    /// Record a release
    pub fn add_release(&mut self, release: &Release) {
        self.releases_by_target
            .entry(release.release_target_key())
            .or_default()
            .insert(release.id.clone());
    }

    /// Record a job
    pub fn add_job(&mut self, job: &Job) {
        self.jobs_by_release
            .entry(job.release_id.clone())
            .or_default()
            .insert(job.id.clone());
    }

    /// Release ids of a target
    pub fn release_ids(&self, target_key: &str) -> impl Iterator<Item = &String> {
        self.releases_by_target.get(target_key).into_iter().flatten()
    }

    /// Job ids of a release
    pub fn job_ids(&self, release_id: &str) -> impl Iterator<Item = &String> {
        self.jobs_by_release.get(release_id).into_iter().flatten()
    }

    /// Releases of a target, oldest first
    pub fn releases<'a>(&self, stores: &'a Stores, target_key: &str) -> Vec<&'a Release> {
        let mut releases: Vec<&Release> = self
            .release_ids(target_key)
            .filter_map(|id| stores.releases.get(id))
            .collect();
        releases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        releases
    }

    /// Jobs of a release, oldest first
    pub fn jobs_for_release<'a>(&self, stores: &'a Stores, release_id: &str) -> Vec<&'a Job> {
        let mut jobs: Vec<&Job> = self
            .job_ids(release_id)
            .filter_map(|id| stores.jobs.get(id))
            .collect();
        jobs.sort_by(job_order);
        jobs
    }

    /// Jobs of every release of a target, oldest first
    pub fn jobs_for_target<'a>(&self, stores: &'a Stores, target_key: &str) -> Vec<&'a Job> {
        let mut jobs: Vec<&Job> = self
            .release_ids(target_key)
            .flat_map(|release_id| self.job_ids(release_id))
            .filter_map(|id| stores.jobs.get(id))
            .collect();
        jobs.sort_by(job_order);
        jobs
    }

    /// Most recently created job of a target
    pub fn latest_job<'a>(&self, stores: &'a Stores, target_key: &str) -> Option<&'a Job> {
        self.jobs_for_target(stores, target_key).into_iter().last()
    }

    /// Release of the most recent successful job of a target
    pub fn current_release<'a>(&self, stores: &'a Stores, target_key: &str) -> Option<&'a Release> {
        self.jobs_for_target(stores, target_key)
            .into_iter()
            .rev()
            .find(|job| job.status == JobStatus::Successful)
            .and_then(|job| stores.releases.get(&job.release_id))
    }

    /// Whether any job of the target succeeded
    pub fn has_successful_release(&self, stores: &Stores, target_key: &str) -> bool {
        self.current_release(stores, target_key).is_some()
    }
}

/// Jobs ordered by creation time, then id
pub fn job_order(a: &&Job, b: &&Job) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}
