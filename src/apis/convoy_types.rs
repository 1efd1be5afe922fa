use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate the Kubernetes wrapper struct `Convoy` from our Spec and Status struct
///
/// A Convoy tracks an ordered batch of beads to completion across whatever
/// polecats pick them up.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Convoy", group = "gastown.io", version = "v1alpha1", namespaced)]
#[kube(status = "ConvoyStatus", shortname = "cv")]
#[allow(non_snake_case)]
pub struct ConvoySpec {
    #[serde(default)]
    pub description: String,

    /// Beads this convoy waits on, in user order.
    pub trackedBeads: Vec<String>,

    /// Mail address notified once every tracked bead is Done.
    pub notifyOnComplete: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConvoyPhase {
    #[default]
    Pending,
    InProgress,
    Complete,
}

impl fmt::Display for ConvoyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConvoyPhase::Pending => "Pending",
            ConvoyPhase::InProgress => "InProgress",
            ConvoyPhase::Complete => "Complete",
        };
        write!(f, "{s}")
    }
}

/// The status object of `Convoy`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct ConvoyStatus {
    #[serde(default)]
    pub phase: ConvoyPhase,

    #[serde(default)]
    pub completedBeads: Vec<String>,

    #[serde(default)]
    pub pendingBeads: Vec<String>,

    /// `completed/total`, e.g. `3/7`.
    #[serde(default)]
    pub progress: String,

    pub startedAt: Option<String>,

    pub completedAt: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
