use crate::defaults;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate the Kubernetes wrapper struct `Refinery` from our Spec and Status struct
///
/// The Refinery drains merge-ready polecat branches into the rig's target
/// branch, one at a time by default.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Refinery", group = "gastown.io", version = "v1alpha1", namespaced)]
#[kube(status = "RefineryStatus", shortname = "rfn")]
#[allow(non_snake_case)]
pub struct RefinerySpec {
    /// Name of the Rig whose polecats feed this queue.
    pub rigRef: String,

    #[serde(default = "defaults::default_target_branch")]
    pub targetBranch: String,

    /// Optional gate command run in the merged tree before pushing.
    /// Validated against the safe-command allowlist; rejected commands
    /// fail the merge without ever reaching a shell.
    pub testCommand: Option<String>,

    /// Merges processed per pass. 1 (the default) fully serializes the
    /// queue for the rig.
    #[serde(default = "defaults::default_parallelism")]
    pub parallelism: i32,

    /// Delete the source branch locally and on the remote after a merge.
    #[serde(default = "defaults::default_delete_branch_on_merge")]
    pub deleteBranchOnMerge: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RefineryPhase {
    #[default]
    Idle,
    Processing,
}

impl fmt::Display for RefineryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefineryPhase::Idle => write!(f, "Idle"),
            RefineryPhase::Processing => write!(f, "Processing"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct MergesSummary {
    #[serde(default)]
    pub pending: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub total: i32,
}

/// The status object of `Refinery`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct RefineryStatus {
    #[serde(default)]
    pub phase: RefineryPhase,

    #[serde(default)]
    pub queueLength: i32,

    /// Polecat currently being merged, if any.
    pub currentMerge: Option<String>,

    #[serde(default)]
    pub mergesSummary: MergesSummary,

    pub lastMergeTime: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
