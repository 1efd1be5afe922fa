use std::time::Duration;
use tracing::warn;

pub fn default_target_branch() -> String {
    "main".to_owned()
}

pub fn default_parallelism() -> i32 {
    1
}

pub fn default_delete_branch_on_merge() -> bool {
    true
}

pub fn default_health_check_interval() -> Option<String> {
    Some("30s".to_owned())
}

pub fn default_stuck_threshold() -> Option<String> {
    Some("15m".to_owned())
}

pub fn default_sync_interval() -> Option<String> {
    Some("5m".to_owned())
}

pub fn default_agent_image() -> String {
    "ghcr.io/gastown/polecat-agent:latest".to_owned()
}

pub fn default_clone_image() -> String {
    "alpine/git:2.40.1".to_owned()
}

pub fn default_workspace_path() -> String {
    "/workspace".to_owned()
}

/// Parse a user-supplied duration string ("30s", "15m"), falling back to
/// the field default when the value is absent or unparseable.
pub fn duration_or(value: Option<&str>, fallback: Duration) -> Duration {
    match value {
        None => fallback,
        Some(raw) => match parse_duration::parse(raw) {
            Ok(d) => d,
            Err(e) => {
                warn!("invalid duration {:?}: {}, using {:?}", raw, e, fallback);
                fallback
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_or_parses_common_forms() {
        assert_eq!(duration_or(Some("30s"), Duration::from_secs(1)), Duration::from_secs(30));
        assert_eq!(duration_or(Some("15m"), Duration::from_secs(1)), Duration::from_secs(900));
    }

    #[test]
    fn duration_or_falls_back() {
        assert_eq!(duration_or(None, Duration::from_secs(300)), Duration::from_secs(300));
        assert_eq!(
            duration_or(Some("not-a-duration"), Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }
}
