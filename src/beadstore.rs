//! BeadStore controller: keeps one rig's issue database in sync with the
//! git remote and reports the observed issue count.

use crate::{
    apis::{
        beadstore_types::{BeadStore, BeadStorePhase, BeadStoreStatus},
        rig_types::Rig,
    },
    conditions::{new_condition, set_condition, TYPE_READY},
    controller::{
        backoff_requeue, patch_status, requeue_long_with_jitter, with_timeout, Context,
        BEADSTORE_FINALIZER, REQUEUE_SHORT,
    },
    defaults::duration_or,
    git::{self, SshAuth},
    telemetry, Error, Result,
};
use chrono::{DateTime, Utc};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
};
use std::{sync::Arc, time::Duration};
use tracing::*;

pub static CONTROLLER_NAME: &str = "beadstore";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Result of one sync pass. Pure so the branch table is testable without
/// a cluster or a git remote.
#[derive(Debug, PartialEq, Eq)]
enum SyncOutcome {
    /// rigRef does not resolve yet.
    MissingRig(String),
    /// Remote listed successfully.
    Synced(i32),
    /// Remote unreachable or unreadable.
    Failed(String),
}

fn apply_sync_outcome(
    status: &mut BeadStoreStatus,
    outcome: &SyncOutcome,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    match outcome {
        SyncOutcome::MissingRig(rig) => {
            status.phase = BeadStorePhase::Pending;
            set_condition(
                &mut status.conditions,
                new_condition(
                    TYPE_READY,
                    false,
                    "RigNotFound",
                    &format!("rig {rig} does not exist"),
                    generation,
                ),
            );
        }
        SyncOutcome::Synced(count) => {
            status.phase = BeadStorePhase::Synced;
            status.issueCount = *count;
            status.lastSyncTime = Some(now.to_rfc3339());
            set_condition(
                &mut status.conditions,
                new_condition(TYPE_READY, true, "SyncComplete", "", generation),
            );
        }
        SyncOutcome::Failed(message) => {
            status.phase = BeadStorePhase::Error;
            set_condition(
                &mut status.conditions,
                new_condition(TYPE_READY, false, "SyncFailed", message, generation),
            );
        }
    }
}

fn requeue_for(outcome: &SyncOutcome, interval: Duration) -> Action {
    match outcome {
        SyncOutcome::MissingRig(_) => Action::requeue(REQUEUE_SHORT),
        SyncOutcome::Synced(_) => Action::requeue(interval),
        SyncOutcome::Failed(_) => requeue_long_with_jitter(),
    }
}

#[instrument(skip(ctx, store), fields(trace_id))]
pub async fn reconcile(store: Arc<BeadStore>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = store.namespace().unwrap(); // beadstore is namespace scoped
    let stores: Api<BeadStore> = Api::namespaced(ctx.client.clone(), &ns);

    debug!("Reconciling BeadStore \"{}\" in {}", store.name_any(), ns);
    finalizer(&stores, BEADSTORE_FINALIZER, store, |event| async {
        match event {
            Finalizer::Apply(store) => store.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(store) => store.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub(crate) fn error_policy(store: Arc<BeadStore>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(CONTROLLER_NAME, &store.name_any(), error);
    backoff_requeue(error)
}

impl BeadStore {
    async fn write_status(&self, ctx: &Context, status: BeadStoreStatus) -> Result<()> {
        let ns = self.namespace().unwrap();
        let stores: Api<BeadStore> = Api::namespaced(ctx.client.clone(), &ns);
        patch_status(&stores, &self.name_any(), "BeadStore", &status).await
    }

    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let interval = duration_or(self.spec.syncInterval.as_deref(), DEFAULT_SYNC_INTERVAL);

        let rigs: Api<Rig> = Api::all(ctx.client.clone());
        let outcome = match with_timeout("rig lookup", rigs.get_opt(&self.spec.rigRef)).await? {
            None => SyncOutcome::MissingRig(self.spec.rigRef.clone()),
            Some(rig) => {
                // Reads run without worker credentials; the remote only
                // needs to expose its refs.
                let auth = SshAuth::anonymous()?;
                match git::count_remote_beads(&auth, &rig.spec.gitURL, &self.spec.prefix).await {
                    Ok(count) => SyncOutcome::Synced(count),
                    Err(e) => {
                        warn!("beadstore {} sync failed: {e}", self.name_any());
                        SyncOutcome::Failed(e.to_string())
                    }
                }
            }
        };

        let mut status = self.status.clone().unwrap_or_default();
        apply_sync_outcome(&mut status, &outcome, self.metadata.generation, Utc::now());
        self.write_status(&ctx, status).await?;
        Ok(requeue_for(&outcome, interval))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteBeadStore".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Deleting".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{conditions::get_condition, controller::REQUEUE_LONG};

    const INTERVAL: Duration = Duration::from_secs(5 * 60);

    #[test]
    fn missing_rig_waits_in_pending() {
        let outcome = SyncOutcome::MissingRig("athena".to_owned());
        let mut status = BeadStoreStatus::default();
        apply_sync_outcome(&mut status, &outcome, Some(1), Utc::now());
        assert_eq!(status.phase, BeadStorePhase::Pending);
        assert!(status.lastSyncTime.is_none());
        let ready = get_condition(&status.conditions, TYPE_READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "RigNotFound");

        assert_eq!(requeue_for(&outcome, INTERVAL), Action::requeue(REQUEUE_SHORT));
    }

    #[test]
    fn successful_sync_records_count_and_time() {
        let outcome = SyncOutcome::Synced(42);
        let mut status = BeadStoreStatus::default();
        apply_sync_outcome(&mut status, &outcome, Some(2), Utc::now());
        assert_eq!(status.phase, BeadStorePhase::Synced);
        assert_eq!(status.issueCount, 42);
        assert!(status.lastSyncTime.is_some());
        let ready = get_condition(&status.conditions, TYPE_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "SyncComplete");

        assert_eq!(requeue_for(&outcome, INTERVAL), Action::requeue(INTERVAL));
    }

    #[test]
    fn sync_failure_backs_off_long() {
        let outcome = SyncOutcome::Failed("ls-remote exited 128".to_owned());
        let mut status = BeadStoreStatus::default();
        status.issueCount = 7;
        apply_sync_outcome(&mut status, &outcome, Some(3), Utc::now());
        assert_eq!(status.phase, BeadStorePhase::Error);
        // the last good count survives a failed pass
        assert_eq!(status.issueCount, 7);
        let ready = get_condition(&status.conditions, TYPE_READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "SyncFailed");
        assert!(ready.message.contains("ls-remote"));

        // long requeue with up to 30s of jitter
        let action = requeue_for(&outcome, INTERVAL);
        let jittered = (0..30).map(|j| Action::requeue(REQUEUE_LONG + Duration::from_secs(j)));
        assert!(jittered.into_iter().any(|a| a == action));
    }

    #[test]
    fn repeated_outcomes_keep_one_ready_condition() {
        let mut status = BeadStoreStatus::default();
        apply_sync_outcome(&mut status, &SyncOutcome::Synced(1), Some(1), Utc::now());
        apply_sync_outcome(
            &mut status,
            &SyncOutcome::Failed("remote hung up".to_owned()),
            Some(1),
            Utc::now(),
        );
        apply_sync_outcome(&mut status, &SyncOutcome::Synced(2), Some(1), Utc::now());
        assert_eq!(
            status.conditions.iter().filter(|c| c.type_ == TYPE_READY).count(),
            1
        );
        assert_eq!(status.phase, BeadStorePhase::Synced);
        assert_eq!(status.issueCount, 2);
    }
}
