use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker-pod template: everything needed to synthesize the pod that runs
/// one polecat. The two secret references are consumed by name only.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct PolecatKubernetesSpec {
    /// SSH clone URL for the repository the worker operates on.
    pub gitRepository: String,

    /// Branch the worker commits to. Defaults to `polecat/<name>`.
    pub gitBranch: Option<String>,

    /// Secret holding an SSH private key under one of the accepted key
    /// names (ssh-privatekey, id_rsa, id_ed25519, identity).
    pub gitSecretRef: String,

    /// Secret holding model-provider credentials, mounted read-only.
    pub claudeCredsSecretRef: String,

    /// Agent container image override.
    pub agentImage: Option<String>,

    /// Where the scratch volume is mounted in both containers.
    pub workspacePath: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum DesiredState {
    #[default]
    Working,
    Idle,
    Terminated,
}

/// Generate the Kubernetes wrapper struct `Polecat` from our Spec and Status struct
///
/// One Polecat is one AI worker assigned to one bead, realized as a single
/// pod. The controller translates `desiredState` into pod reality and pod
/// phase back into status.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Polecat", group = "gastown.io", version = "v1alpha1", namespaced)]
#[kube(status = "PolecatStatus", shortname = "pc")]
#[allow(non_snake_case)]
pub struct PolecatSpec {
    /// Name of the parent Rig.
    pub rig: String,

    #[serde(default)]
    pub desiredState: DesiredState,

    /// Issue identifier this worker is assigned, `<prefix>-<id>`.
    pub beadID: String,

    /// Pod synthesis inputs. Required while desiredState=Working.
    pub kubernetes: Option<PolecatKubernetesSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PolecatPhase {
    #[default]
    Idle,
    Working,
    Done,
    Stuck,
    Terminated,
}

impl fmt::Display for PolecatPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolecatPhase::Idle => "Idle",
            PolecatPhase::Working => "Working",
            PolecatPhase::Done => "Done",
            PolecatPhase::Stuck => "Stuck",
            PolecatPhase::Terminated => "Terminated",
        };
        write!(f, "{s}")
    }
}

/// The status object of `Polecat`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct PolecatStatus {
    #[serde(default)]
    pub phase: PolecatPhase,

    /// Name of the worker pod, when one exists.
    pub podName: Option<String>,

    /// Bead the running pod was synthesized for.
    pub assignedBead: Option<String>,

    #[serde(default)]
    pub podActive: bool,

    /// Work branch the Refinery merges from.
    pub branch: Option<String>,

    /// RFC 3339 timestamp of the last observed pod activity.
    pub lastActivity: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
