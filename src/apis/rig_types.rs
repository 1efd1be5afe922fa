use crate::defaults;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate the Kubernetes wrapper struct `Rig` from our Spec and Status struct
///
/// A Rig is a project workspace: the logical parent of the polecats working
/// on it and of the per-rig Witness/Refinery/BeadStore children. Rigs are
/// cluster-scoped; their children live in the configured child namespace and
/// are tied back by the `rig-owner` label.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Rig", group = "gastown.io", version = "v1alpha1")]
#[kube(status = "RigStatus", shortname = "rig")]
#[allow(non_snake_case)]
pub struct RigSpec {
    /// SSH URL of the git remote all polecats of this rig clone and push to.
    pub gitURL: String,

    /// Issue identifiers for this rig look like `<beadsPrefix>-<id>`.
    pub beadsPrefix: String,

    /// Branch merged work lands on.
    #[serde(default = "defaults::default_target_branch")]
    pub targetBranch: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RigPhase {
    #[default]
    Ready,
    Degraded,
}

impl fmt::Display for RigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RigPhase::Ready => write!(f, "Ready"),
            RigPhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// The status object of `Rig`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct RigStatus {
    #[serde(default)]
    pub phase: RigPhase,

    /// Count of polecats currently referencing this rig.
    #[serde(default)]
    pub activePolecats: i32,

    /// Count of convoys not yet complete.
    #[serde(default)]
    pub activeConvoys: i32,

    #[serde(default)]
    pub witnessCreated: bool,

    #[serde(default)]
    pub refineryCreated: bool,

    /// Namespace the children were provisioned into.
    pub childNamespace: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
