use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace where Rig provisions its Witness/Refinery/BeadStore children.
    pub child_namespace: String,
    /// Listener for the Prometheus scrape endpoint.
    pub metrics_bind_address: String,
    /// Listener for liveness/readiness probes. May equal the metrics listener.
    pub health_probe_bind_address: String,
    /// When true, only the Lease holder reconciles.
    pub enable_leader_election: bool,
    /// Namespace holding the leader-election Lease.
    pub operator_namespace: String,
    /// Mail gateway consumed by Witness escalation and Convoy notices.
    /// Unset means sends are logged instead of delivered.
    pub mail_gateway: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            child_namespace: from_env_default("GASTOWN_CHILD_NAMESPACE", "gastown-system"),
            metrics_bind_address: from_env_default("METRICS_BIND_ADDRESS", "0.0.0.0:8080"),
            health_probe_bind_address: from_env_default("HEALTH_PROBE_BIND_ADDRESS", "0.0.0.0:8080"),
            enable_leader_election: from_env_default("ENABLE_LEADER_ELECTION", "false")
                .parse()
                .unwrap_or(false),
            operator_namespace: from_env_default("POD_NAMESPACE", "gastown-system"),
            mail_gateway: env::var("GASTOWN_MAIL_GATEWAY").ok(),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config::default();
        assert_eq!(cfg.child_namespace, "gastown-system");
        assert!(!cfg.enable_leader_election);
    }
}
