use crate::defaults;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EscalationTarget {
    #[default]
    Mayor,
    Slack,
    Email,
}

impl fmt::Display for EscalationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationTarget::Mayor => "mayor",
            EscalationTarget::Slack => "slack",
            EscalationTarget::Email => "email",
        };
        write!(f, "{s}")
    }
}

/// Generate the Kubernetes wrapper struct `Witness` from our Spec and Status struct
///
/// The Witness watches the polecats of one rig, classifies them, detects
/// workers stuck past the threshold and escalates with a circuit breaker.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Witness", group = "gastown.io", version = "v1alpha1", namespaced)]
#[kube(status = "WitnessStatus", shortname = "wit")]
#[allow(non_snake_case)]
pub struct WitnessSpec {
    /// Name of the Rig whose polecats are observed.
    pub rigRef: String,

    /// Duration string, e.g. "30s".
    #[serde(default = "defaults::default_health_check_interval")]
    pub healthCheckInterval: Option<String>,

    /// A polecat progressing longer than this without a condition
    /// transition counts as stuck. Duration string, e.g. "15m".
    #[serde(default = "defaults::default_stuck_threshold")]
    pub stuckThreshold: Option<String>,

    #[serde(default)]
    pub escalationTarget: EscalationTarget,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum WitnessPhase {
    #[default]
    Pending,
    Active,
    Degraded,
}

impl fmt::Display for WitnessPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WitnessPhase::Pending => "Pending",
            WitnessPhase::Active => "Active",
            WitnessPhase::Degraded => "Degraded",
        };
        write!(f, "{s}")
    }
}

/// Per-cycle classification counts.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub struct PolecatSummary {
    #[serde(default)]
    pub total: i32,
    #[serde(default)]
    pub running: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub stuck: i32,
}

/// The status object of `Witness`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct WitnessStatus {
    #[serde(default)]
    pub phase: WitnessPhase,

    pub lastCheckTime: Option<String>,

    #[serde(default)]
    pub summary: PolecatSummary,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
