use crate::defaults;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate the Kubernetes wrapper struct `BeadStore` from our Spec and Status struct
///
/// Sync configuration for one rig's issue database, kept in the git remote.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "BeadStore", group = "gastown.io", version = "v1alpha1", namespaced)]
#[kube(status = "BeadStoreStatus", shortname = "bs")]
#[allow(non_snake_case)]
pub struct BeadStoreSpec {
    /// Name of the Rig this store belongs to.
    pub rigRef: String,

    /// Bead identifier prefix, normally the rig's beadsPrefix.
    pub prefix: String,

    /// Duration string, e.g. "5m".
    #[serde(default = "defaults::default_sync_interval")]
    pub syncInterval: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum BeadStorePhase {
    #[default]
    Pending,
    Synced,
    Error,
}

impl fmt::Display for BeadStorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BeadStorePhase::Pending => "Pending",
            BeadStorePhase::Synced => "Synced",
            BeadStorePhase::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// The status object of `BeadStore`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct BeadStoreStatus {
    #[serde(default)]
    pub phase: BeadStorePhase,

    pub lastSyncTime: Option<String>,

    /// Issues observed at the last successful sync, clamped to i32 range.
    #[serde(default)]
    pub issueCount: i32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
