/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
mod config;
pub use config::Config;
pub mod defaults;

pub mod conditions;
mod escalation;
#[cfg(test)] pub mod fixtures;
pub mod git;
pub mod mail;
mod workerpod;

mod beadstore;
mod convoy;
mod polecat;
mod refinery;
mod rig;
mod witness;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Git Error: {0}")]
    GitError(String),

    #[error("Pod Error: {0}")]
    PodError(String),

    #[error("Missing Secret Error: {0}")]
    MissingSecretError(String),

    #[error("Invalid Spec: {0}")]
    InvalidSpec(String),

    #[error("Timed out during {0}")]
    TimeoutError(String),

    #[error("Mail Error: {0}")]
    MailError(String),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(&['(', ' '][..])
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}
