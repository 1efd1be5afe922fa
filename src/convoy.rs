//! Convoy controller: tracks a batch of beads across all polecats and
//! reports aggregate progress until every tracked bead is Done.

use crate::{
    apis::{
        convoy_types::{Convoy, ConvoyPhase, ConvoyStatus},
        polecat_types::{Polecat, PolecatPhase},
    },
    conditions::{new_condition, set_condition, TYPE_COMPLETE},
    controller::{backoff_requeue, patch_status, with_timeout, Context, REQUEUE_DEFAULT, REQUEUE_SHORT},
    telemetry, Error, Result,
};
use chrono::Utc;
use kube::{
    api::{Api, ListParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
};
use std::{collections::HashMap, sync::Arc};
use tracing::*;

pub static CONTROLLER_NAME: &str = "convoy";

/// Split the tracked beads into done and not-done, preserving spec order.
pub(crate) fn partition_beads(
    tracked: &[String],
    phases: &HashMap<String, PolecatPhase>,
) -> (Vec<String>, Vec<String>) {
    let mut completed = Vec::new();
    let mut pending = Vec::new();
    for bead in tracked {
        if phases.get(bead) == Some(&PolecatPhase::Done) {
            completed.push(bead.clone());
        } else {
            pending.push(bead.clone());
        }
    }
    (completed, pending)
}

pub(crate) fn progress(completed: usize, total: usize) -> String {
    format!("{completed}/{total}")
}

#[instrument(skip(ctx, convoy), fields(trace_id))]
pub async fn reconcile(convoy: Arc<Convoy>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = convoy.namespace().unwrap(); // convoy is namespace scoped
    let name = convoy.name_any();
    let convoys: Api<Convoy> = Api::namespaced(ctx.client.clone(), &ns);
    debug!("Reconciling Convoy \"{name}\" in {ns}");

    let mut status = convoy.status.clone().unwrap_or_default();
    let total = convoy.spec.trackedBeads.len();

    match status.phase {
        // Terminal; nothing changes a completed convoy.
        ConvoyPhase::Complete => Ok(Action::await_change()),

        ConvoyPhase::Pending => {
            status.phase = ConvoyPhase::InProgress;
            status.pendingBeads = convoy.spec.trackedBeads.clone();
            status.completedBeads = Vec::new();
            status.progress = progress(0, total);
            status.startedAt = Some(Utc::now().to_rfc3339());
            patch_status(&convoys, &name, "Convoy", &status).await?;
            Ok(Action::requeue(REQUEUE_SHORT))
        }

        ConvoyPhase::InProgress => {
            // Beads are rig-prefixed and polecats may live anywhere, so the
            // lookup is cluster-wide.
            let polecats: Api<Polecat> = Api::all(ctx.client.clone());
            let list = with_timeout("polecat list", polecats.list(&ListParams::default())).await?;
            let phases: HashMap<String, PolecatPhase> = list
                .items
                .iter()
                .filter_map(|pc| {
                    let s = pc.status.as_ref()?;
                    Some((s.assignedBead.clone()?, s.phase))
                })
                .collect();

            let (completed, pending) = partition_beads(&convoy.spec.trackedBeads, &phases);
            // Vacuously true for an empty tracked set; such a convoy
            // completes on its first pass.
            let done = pending.is_empty();
            status.progress = progress(completed.len(), total);
            status.completedBeads = completed;
            status.pendingBeads = pending;

            if !done {
                if convoy.status.as_ref() != Some(&status) {
                    patch_status(&convoys, &name, "Convoy", &status).await?;
                }
                return Ok(Action::requeue(REQUEUE_DEFAULT));
            }

            // Notify before the terminal write; a failed send retries the
            // whole pass rather than dropping the notification.
            if let Some(address) = &convoy.spec.notifyOnComplete {
                ctx.mailer
                    .send(
                        address,
                        &format!("Convoy {name} complete"),
                        &format!(
                            "All {total} tracked bead(s) are done: {}",
                            status.completedBeads.join(", ")
                        ),
                    )
                    .await?;
            }
            status.phase = ConvoyPhase::Complete;
            status.completedAt = Some(Utc::now().to_rfc3339());
            set_condition(
                &mut status.conditions,
                new_condition(
                    TYPE_COMPLETE,
                    true,
                    "AllBeadsDone",
                    "",
                    convoy.metadata.generation,
                ),
            );
            patch_status(&convoys, &name, "Convoy", &status).await?;
            let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), convoy.as_ref());
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "ConvoyComplete".into(),
                    note: Some(format!("All {total} tracked bead(s) are done")),
                    action: "Tracking".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
            Ok(Action::await_change())
        }
    }
}

pub(crate) fn error_policy(convoy: Arc<Convoy>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(CONTROLLER_NAME, &convoy.name_any(), error);
    backoff_requeue(error)
}

#[cfg(test)]
mod test {
    use super::*;

    fn beads(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partitions_by_done_phase() {
        let tracked = beads(&["at-1", "at-2", "at-3"]);
        let phases = HashMap::from([
            ("at-1".to_owned(), PolecatPhase::Done),
            ("at-2".to_owned(), PolecatPhase::Working),
        ]);
        let (completed, pending) = partition_beads(&tracked, &phases);
        assert_eq!(completed, beads(&["at-1"]));
        // untracked bead at-3 stays pending alongside the working one
        assert_eq!(pending, beads(&["at-2", "at-3"]));
    }

    #[test]
    fn progress_matches_partition_sizes() {
        let tracked = beads(&["at-1", "at-2"]);
        let phases = HashMap::from([
            ("at-1".to_owned(), PolecatPhase::Done),
            ("at-2".to_owned(), PolecatPhase::Done),
        ]);
        let (completed, pending) = partition_beads(&tracked, &phases);
        assert_eq!(progress(completed.len(), tracked.len()), "2/2");
        assert!(pending.is_empty());
    }

    #[test]
    fn empty_tracked_set_is_vacuously_done() {
        let tracked: Vec<String> = vec![];
        let (completed, pending) = partition_beads(&tracked, &HashMap::new());
        assert!(completed.is_empty());
        assert!(pending.is_empty(), "no bead can be outstanding in an empty convoy");
        assert_eq!(progress(completed.len(), tracked.len()), "0/0");
    }

    #[test]
    fn stuck_and_idle_workers_do_not_complete_beads() {
        let tracked = beads(&["at-1"]);
        for phase in [PolecatPhase::Idle, PolecatPhase::Working, PolecatPhase::Stuck, PolecatPhase::Terminated] {
            let phases = HashMap::from([("at-1".to_owned(), phase)]);
            let (completed, _) = partition_beads(&tracked, &phases);
            assert!(completed.is_empty(), "{phase:?} should not complete a bead");
        }
    }
}
