use crate::store::Store;
use rollout_core::{
    Deployment, DeploymentVersion, Entity, Environment, Job, JobAgent, JobVerification, Policy,
    Release, Resource, ResourceProvider, ResourceVariable, RelationshipRule, System,
    UserApprovalRecord,
};
use serde::{Deserialize, Serialize};

/// Every entity store of a workspace.
///
/// This is the persisted part of a workspace; indexes and caches are derived
/// from it and rebuilt after a snapshot restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stores {
    /// Systems
    #[serde(default)]
    pub systems: Store<System>,
    /// Deployments
    #[serde(default)]
    pub deployments: Store<Deployment>,
    /// Environments
    #[serde(default)]
    pub environments: Store<Environment>,
    /// Resources
    #[serde(default)]
    pub resources: Store<Resource>,
    /// Resource providers
    #[serde(default)]
    pub resource_providers: Store<ResourceProvider>,
    /// Deployment versions
    #[serde(default)]
    pub deployment_versions: Store<DeploymentVersion>,
    /// Job agents
    #[serde(default)]
    pub job_agents: Store<JobAgent>,
    /// Policies
    #[serde(default)]
    pub policies: Store<Policy>,
    /// User approval records
    #[serde(default)]
    pub user_approval_records: Store<UserApprovalRecord>,
    /// Relationship rules
    #[serde(default)]
    pub relationship_rules: Store<RelationshipRule>,
    /// Resource variables
    #[serde(default)]
    pub resource_variables: Store<ResourceVariable>,
    /// Releases (never deleted)
    #[serde(default)]
    pub releases: Store<Release>,
    /// Jobs (never deleted)
    #[serde(default)]
    pub jobs: Store<Job>,
    /// Job verifications
    #[serde(default)]
    pub job_verifications: Store<JobVerification>,
}

impl Stores {
    /// Ready versions of a deployment, newest first (`createdAt`, then tag
    /// descending)
    pub fn ready_versions(&self, deployment_id: &str) -> Vec<&DeploymentVersion> {
        let mut versions: Vec<&DeploymentVersion> = self
            .deployment_versions
            .values()
            .filter(|v| v.deployment_id == deployment_id)
            .filter(|v| v.status == rollout_core::VersionStatus::Ready)
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.tag.cmp(&a.tag)));
        versions
    }

    /// Resource currently holding an identifier
    pub fn resource_by_identifier(&self, identifier: &str) -> Option<&Resource> {
        self.resources.values().find(|r| r.identifier == identifier)
    }

    /// Variables attached to a resource, ordered by key
    pub fn variables_for_resource(&self, resource_id: &str) -> Vec<&ResourceVariable> {
        let mut vars: Vec<&ResourceVariable> = self
            .resource_variables
            .values()
            .filter(|v| v.resource_id == resource_id)
            .collect();
        vars.sort_by(|a, b| a.key.cmp(&b.key));
        vars
    }
}

/// Entities held in a [`Stores`] field
pub trait StoredEntity: Entity {
    /// The store holding this kind
    fn store(stores: &Stores) -> &Store<Self>;

    /// Mutable access to the store holding this kind
    fn store_mut(stores: &mut Stores) -> &mut Store<Self>;
}

macro_rules! stored_in {
    ($ty:ty, $field:ident) => {
        impl StoredEntity for $ty {
            fn store(stores: &Stores) -> &Store<Self> {
                &stores.$field
            }

            fn store_mut(stores: &mut Stores) -> &mut Store<Self> {
                &mut stores.$field
            }
        }
    };
}

stored_in!(System, systems);
stored_in!(Deployment, deployments);
stored_in!(Environment, environments);
stored_in!(Resource, resources);
stored_in!(ResourceProvider, resource_providers);
stored_in!(DeploymentVersion, deployment_versions);
stored_in!(JobAgent, job_agents);
stored_in!(Policy, policies);
stored_in!(UserApprovalRecord, user_approval_records);
stored_in!(RelationshipRule, relationship_rules);
stored_in!(ResourceVariable, resource_variables);
stored_in!(Release, releases);
stored_in!(Job, jobs);
stored_in!(JobVerification, job_verifications);
