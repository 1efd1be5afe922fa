//! Refinery controller: drains merge-ready polecat branches into the rig's
//! target branch. Work arrives as a level-triggered queue — every pass
//! re-lists candidates, merges up to `parallelism` of them, and requeues
//! quickly while anything is left.

use crate::{
    apis::{
        polecat_types::Polecat,
        refinery_types::{Refinery, RefineryPhase, RefineryStatus},
        rig_types::Rig,
    },
    conditions::{is_condition_true, new_condition, set_condition, work_complete, TYPE_MERGED},
    controller::{
        backoff_requeue, patch_status, with_timeout, Context, REQUEUE_DEFAULT, REQUEUE_DRAIN,
        REQUEUE_LONG,
    },
    git::{self, MergeParams, SshAuth},
    telemetry, workerpod, Error, Result,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
};
use std::sync::Arc;
use tracing::*;

pub static CONTROLLER_NAME: &str = "refinery";

/// A polecat joins the queue once its work is complete and leaves it once
/// merged.
pub(crate) fn merge_ready(polecat: &Polecat) -> bool {
    let conditions = polecat
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    work_complete(conditions) && !is_condition_true(conditions, TYPE_MERGED)
}

#[instrument(skip(ctx, refinery), fields(trace_id))]
pub async fn reconcile(refinery: Arc<Refinery>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = refinery.namespace().unwrap(); // refinery is namespace scoped
    let name = refinery.name_any();
    debug!("Reconciling Refinery \"{name}\" in {ns}");

    let polecats: Api<Polecat> = Api::all(ctx.client.clone());
    let list = with_timeout("polecat list", polecats.list(&ListParams::default())).await?;
    let mut queue: Vec<Polecat> = list
        .items
        .into_iter()
        .filter(|pc| pc.spec.rig == refinery.spec.rigRef && merge_ready(pc))
        .collect();
    // Names make the drain order deterministic across passes.
    queue.sort_by_key(|pc| pc.name_any());

    let mut status = refinery.status.clone().unwrap_or_default();
    status.mergesSummary.pending = queue.len() as i32;
    status.queueLength = queue.len() as i32;

    if queue.is_empty() {
        status.phase = RefineryPhase::Idle;
        status.currentMerge = None;
        write_status(&ctx, &refinery, status).await?;
        return Ok(Action::requeue(REQUEUE_DEFAULT));
    }

    // Step 1 of every merge: the rig supplies the git URL.
    let rigs: Api<Rig> = Api::all(ctx.client.clone());
    let rig = match with_timeout("rig lookup", rigs.get_opt(&refinery.spec.rigRef)).await? {
        Some(rig) => rig,
        None => {
            warn!("refinery {name} references missing rig {}", refinery.spec.rigRef);
            status.phase = RefineryPhase::Idle;
            write_status(&ctx, &refinery, status).await?;
            return Ok(Action::requeue(REQUEUE_LONG));
        }
    };

    status.phase = RefineryPhase::Processing;
    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), refinery.as_ref());
    let batch = refinery.spec.parallelism.max(1) as usize;

    for polecat in queue.iter().take(batch) {
        let polecat_name = polecat.name_any();
        status.currentMerge = Some(polecat_name.clone());
        match merge_one(&ctx, &rig, &refinery, polecat).await {
            Ok(sha) => {
                info!("merged {polecat_name} into {} at {sha}", refinery.spec.targetBranch);
                mark_merged(&ctx, polecat, &sha).await?;
                status.mergesSummary.succeeded += 1;
                status.mergesSummary.total += 1;
                status.mergesSummary.pending -= 1;
                status.queueLength -= 1;
                status.lastMergeTime = Some(Utc::now().to_rfc3339());
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "MergeComplete".into(),
                        note: Some(format!("Merged `{polecat_name}` at {sha}")),
                        action: "Merging".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            Err(e) => {
                // One failed merge neither poisons the queue nor the
                // reconcile; the next candidate still gets its turn.
                warn!("merge of {polecat_name} failed: {e}");
                status.mergesSummary.failed += 1;
                status.mergesSummary.total += 1;
                recorder
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "MergeFailed".into(),
                        note: Some(format!("Merge of `{polecat_name}` failed: {e}")),
                        action: "Merging".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
        }
    }

    status.currentMerge = None;
    let remaining = status.queueLength;
    if remaining == 0 {
        status.phase = RefineryPhase::Idle;
    }
    write_status(&ctx, &refinery, status).await?;

    if remaining > 0 {
        Ok(Action::requeue(REQUEUE_DRAIN))
    } else {
        Ok(Action::requeue(REQUEUE_DEFAULT))
    }
}

async fn write_status(ctx: &Context, refinery: &Refinery, status: RefineryStatus) -> Result<()> {
    if refinery.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let ns = refinery.namespace().unwrap();
    let refineries: Api<Refinery> = Api::namespaced(ctx.client.clone(), &ns);
    patch_status(&refineries, &refinery.name_any(), "Refinery", &status).await
}

async fn merge_one(ctx: &Context, rig: &Rig, refinery: &Refinery, polecat: &Polecat) -> Result<String> {
    let polecat_ns = polecat
        .namespace()
        .ok_or_else(|| Error::InvalidSpec("polecat is not namespaced".to_owned()))?;
    let secret_name = polecat
        .spec
        .kubernetes
        .as_ref()
        .map(|k| k.gitSecretRef.clone())
        .ok_or_else(|| Error::MissingSecretError("polecat has no gitSecretRef".to_owned()))?;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &polecat_ns);
    let secret = with_timeout("secret lookup", secrets.get(&secret_name)).await?;
    let auth = SshAuth::from_secret(&secret)?;

    let source_branch = polecat
        .status
        .as_ref()
        .and_then(|s| s.branch.clone())
        .unwrap_or_else(|| workerpod::work_branch(polecat));

    git::merge_branch(
        &auth,
        MergeParams {
            git_url: &rig.spec.gitURL,
            source_branch: &source_branch,
            target_branch: &refinery.spec.targetBranch,
            test_command: refinery.spec.testCommand.as_deref(),
            delete_source_branch: refinery.spec.deleteBranchOnMerge,
        },
    )
    .await
}

/// Record the merge on the polecat so it leaves the queue.
async fn mark_merged(ctx: &Context, polecat: &Polecat, sha: &str) -> Result<()> {
    let ns = polecat.namespace().unwrap();
    let mut status = polecat.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        new_condition(
            TYPE_MERGED,
            true,
            "MergeComplete",
            &format!("Merged at {sha}"),
            polecat.metadata.generation,
        ),
    );
    let polecats: Api<Polecat> = Api::namespaced(ctx.client.clone(), &ns);
    patch_status(&polecats, &polecat.name_any(), "Polecat", &status).await
}

pub(crate) fn error_policy(refinery: Arc<Refinery>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(CONTROLLER_NAME, &refinery.name_any(), error);
    backoff_requeue(error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        apis::polecat_types::{PolecatSpec, PolecatStatus},
        conditions::{TYPE_AVAILABLE, TYPE_DEGRADED, TYPE_PROGRESSING, TYPE_READY},
    };

    fn polecat_with(conditions: Vec<(&str, bool, &str)>) -> Polecat {
        let mut status = PolecatStatus::default();
        for (type_, value, reason) in conditions {
            status
                .conditions
                .push(new_condition(type_, value, reason, "", Some(1)));
        }
        let mut pc = Polecat::new("subject", PolecatSpec::default());
        pc.status = Some(status);
        pc
    }

    #[test]
    fn selects_available_workers() {
        assert!(merge_ready(&polecat_with(vec![(TYPE_AVAILABLE, true, "WorkComplete")])));
    }

    #[test]
    fn selects_legacy_succeeded_workers() {
        assert!(merge_ready(&polecat_with(vec![(TYPE_READY, true, "PodSucceeded")])));
        // reason guard: a generic Ready does not queue a merge
        assert!(!merge_ready(&polecat_with(vec![(TYPE_READY, true, "Provisioned")])));
    }

    #[test]
    fn skips_already_merged_and_unfinished_workers() {
        assert!(!merge_ready(&polecat_with(vec![
            (TYPE_AVAILABLE, true, "WorkComplete"),
            (TYPE_MERGED, true, "MergeComplete"),
        ])));
        assert!(!merge_ready(&polecat_with(vec![(TYPE_PROGRESSING, true, "PodRunning")])));
        assert!(!merge_ready(&polecat_with(vec![(TYPE_DEGRADED, true, "PodFailed")])));
        assert!(!merge_ready(&polecat_with(vec![])));
    }
}
