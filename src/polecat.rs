//! Polecat controller: translates `desiredState` into pod reality and pod
//! phase back into worker status.

use crate::{
    apis::polecat_types::{DesiredState, Polecat, PolecatPhase, PolecatStatus},
    conditions::{
        new_condition, set_condition, REASON_POD_SUCCEEDED, TYPE_AVAILABLE, TYPE_DEGRADED,
        TYPE_PROGRESSING, TYPE_READY, TYPE_WORKING,
    },
    controller::{
        backoff_requeue, patch_status, with_timeout, Context, POLECAT_FINALIZER, REQUEUE_DEFAULT,
        REQUEUE_LONG, REQUEUE_SHORT,
    },
    telemetry, workerpod, Error, Result,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, PostParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
};
use std::sync::Arc;
use tracing::*;

pub static CONTROLLER_NAME: &str = "polecat";

#[instrument(skip(ctx, polecat), fields(trace_id))]
pub async fn reconcile(polecat: Arc<Polecat>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = polecat.namespace().unwrap(); // polecat is namespace scoped
    let polecats: Api<Polecat> = Api::namespaced(ctx.client.clone(), &ns);

    debug!("Reconciling Polecat \"{}\" in {}", polecat.name_any(), ns);
    finalizer(&polecats, POLECAT_FINALIZER, polecat, |event| async {
        match event {
            Finalizer::Apply(pc) => pc.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(pc) => pc.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub(crate) fn error_policy(polecat: Arc<Polecat>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(CONTROLLER_NAME, &polecat.name_any(), error);
    backoff_requeue(error)
}

/// What a pod phase means for the worker. Pure so the mapping table is
/// testable without a cluster.
#[derive(Debug, PartialEq, Eq)]
struct PodAssessment {
    phase: PolecatPhase,
    pod_active: bool,
    available: bool,
    progressing: bool,
    degraded: bool,
    reason: &'static str,
}

fn assess_pod_phase(pod_phase: Option<&str>) -> PodAssessment {
    match pod_phase {
        Some("Running") => PodAssessment {
            phase: PolecatPhase::Working,
            pod_active: true,
            available: false,
            progressing: true,
            degraded: false,
            reason: "PodRunning",
        },
        Some("Succeeded") => PodAssessment {
            phase: PolecatPhase::Done,
            pod_active: false,
            available: true,
            progressing: false,
            degraded: false,
            reason: "WorkComplete",
        },
        Some("Failed") => PodAssessment {
            phase: PolecatPhase::Stuck,
            pod_active: false,
            available: false,
            progressing: false,
            degraded: true,
            reason: "PodFailed",
        },
        // Pending, Unknown, or no phase reported yet
        _ => PodAssessment {
            phase: PolecatPhase::Working,
            pod_active: false,
            available: false,
            progressing: true,
            degraded: false,
            reason: "PodPending",
        },
    }
}

impl Polecat {
    fn status_base(&self) -> PolecatStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Write both the new condition triad and the legacy Ready/Working
    /// pair; consumers that have not migrated still read the latter.
    fn apply_worker_conditions(&self, status: &mut PolecatStatus, a: &PodAssessment) {
        let generation = self.metadata.generation;
        set_condition(
            &mut status.conditions,
            new_condition(TYPE_AVAILABLE, a.available, a.reason, "", generation),
        );
        set_condition(
            &mut status.conditions,
            new_condition(TYPE_PROGRESSING, a.progressing, a.reason, "", generation),
        );
        set_condition(
            &mut status.conditions,
            new_condition(TYPE_DEGRADED, a.degraded, a.reason, "", generation),
        );
        set_condition(
            &mut status.conditions,
            new_condition(TYPE_WORKING, a.progressing, a.reason, "", generation),
        );
        let legacy_reason = if a.available { REASON_POD_SUCCEEDED } else { a.reason };
        set_condition(
            &mut status.conditions,
            new_condition(TYPE_READY, a.available, legacy_reason, "", generation),
        );
    }

    async fn write_status(&self, ctx: &Context, status: PolecatStatus) -> Result<()> {
        if self.status.as_ref() == Some(&status) {
            // Idempotent pass; writing would only churn resourceVersion.
            return Ok(());
        }
        let ns = self.namespace().unwrap();
        let polecats: Api<Polecat> = Api::namespaced(ctx.client.clone(), &ns);
        patch_status(&polecats, &self.name_any(), "Polecat", &status).await
    }

    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        match self.spec.desiredState {
            DesiredState::Working => self.ensure_working(ctx).await,
            DesiredState::Idle => self.ensure_idle(ctx).await,
            DesiredState::Terminated => self.ensure_terminated(ctx).await,
        }
    }

    async fn ensure_working(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap();

        if self.spec.kubernetes.is_none() {
            let mut status = self.status_base();
            status.phase = PolecatPhase::Stuck;
            set_condition(
                &mut status.conditions,
                new_condition(
                    TYPE_READY,
                    false,
                    "MissingKubernetesSpec",
                    "desiredState is Working but no worker-pod template is set",
                    self.metadata.generation,
                ),
            );
            self.write_status(&ctx, status).await?;
            return Ok(Action::requeue(REQUEUE_LONG));
        }

        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        let pod_name = workerpod::pod_name(self);
        let existing = with_timeout("pod lookup", pods.get_opt(&pod_name)).await?;

        let mut status = self.status_base();
        let action = match existing {
            None => {
                let pod = workerpod::worker_pod_from_polecat(self)?;
                match with_timeout("pod create", pods.create(&PostParams::default(), &pod)).await {
                    Ok(_) => {
                        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
                        recorder
                            .publish(Event {
                                type_: EventType::Normal,
                                reason: "PodCreated".into(),
                                note: Some(format!("Created worker pod `{pod_name}`")),
                                action: "Working".into(),
                                secondary: None,
                            })
                            .await
                            .map_err(Error::KubeError)?;
                    }
                    // Lost a create race with a previous reconcile; the
                    // level-triggered pass below will observe the pod.
                    Err(Error::KubeError(kube::Error::Api(e))) if e.code == 409 => {
                        debug!("worker pod {pod_name} already exists");
                    }
                    Err(e) => return Err(e),
                }
                let assessment = assess_pod_phase(None);
                status.phase = PolecatPhase::Working;
                status.podName = Some(pod_name);
                status.assignedBead = Some(self.spec.beadID.clone());
                status.podActive = false;
                status.branch = Some(workerpod::work_branch(self));
                self.apply_worker_conditions(&mut status, &assessment);
                Action::requeue(REQUEUE_SHORT)
            }
            Some(pod) => {
                let pod_phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                let assessment = assess_pod_phase(pod_phase);
                if let Some(started) = pod.status.as_ref().and_then(|s| s.start_time.as_ref()) {
                    status.lastActivity = Some(started.0.to_rfc3339());
                }
                status.phase = assessment.phase;
                status.podName = Some(pod_name);
                status.assignedBead = Some(self.spec.beadID.clone());
                status.podActive = assessment.pod_active;
                status.branch = Some(workerpod::work_branch(self));
                self.apply_worker_conditions(&mut status, &assessment);
                match assessment.phase {
                    // Done and Stuck are settled; a spec edit or pod event
                    // wakes us up again.
                    PolecatPhase::Done => {
                        self.publish_once(
                            &ctx,
                            "WorkComplete",
                            &format!("Bead {} is merge-ready", self.spec.beadID),
                        )
                        .await?;
                        Action::requeue(REQUEUE_DEFAULT)
                    }
                    PolecatPhase::Stuck => {
                        self.publish_once(
                            &ctx,
                            "PodFailed",
                            &format!("Worker pod `{}` failed", status.podName.as_deref().unwrap_or("")),
                        )
                        .await?;
                        Action::requeue(REQUEUE_LONG)
                    }
                    _ => Action::requeue(REQUEUE_SHORT),
                }
            }
        };
        self.write_status(&ctx, status).await?;
        Ok(action)
    }

    async fn ensure_idle(&self, ctx: Arc<Context>) -> Result<Action> {
        if self.delete_worker_pod(&ctx).await? {
            let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "PodDeleted".into(),
                    note: Some(format!("Deleted worker pod `{}`", workerpod::pod_name(self))),
                    action: "Idling".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
        }
        let mut status = self.status_base();
        status.phase = PolecatPhase::Idle;
        status.podName = None;
        status.assignedBead = None;
        status.podActive = false;
        let generation = self.metadata.generation;
        for (type_, reason) in [
            (TYPE_AVAILABLE, "Idle"),
            (TYPE_PROGRESSING, "Idle"),
            (TYPE_DEGRADED, "Idle"),
            (TYPE_WORKING, "Idle"),
            (TYPE_READY, "Idle"),
        ] {
            set_condition(
                &mut status.conditions,
                new_condition(type_, false, reason, "", generation),
            );
        }
        self.write_status(&ctx, status).await?;
        Ok(Action::requeue(REQUEUE_DEFAULT))
    }

    async fn ensure_terminated(&self, ctx: Arc<Context>) -> Result<Action> {
        self.delete_worker_pod(&ctx).await?;
        let mut status = self.status_base();
        status.phase = PolecatPhase::Terminated;
        status.podName = None;
        status.podActive = false;
        self.write_status(&ctx, status).await?;
        // Terminal state; nothing to poll for.
        Ok(Action::await_change())
    }

    /// Delete the worker pod if one exists. NotFound is success.
    async fn delete_worker_pod(&self, ctx: &Context) -> Result<bool> {
        let ns = self.namespace().unwrap();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        let pod_name = workerpod::pod_name(self);
        match with_timeout("pod delete", pods.delete(&pod_name, &DeleteParams::default())).await {
            Ok(_) => Ok(true),
            Err(Error::KubeError(kube::Error::Api(e))) if e.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        let pod_name = workerpod::pod_name(self);

        self.delete_worker_pod(&ctx).await?;
        // Hold the finalizer until the pod is really gone; grace periods
        // mean the first delete usually returns before removal.
        if with_timeout("pod lookup", pods.get_opt(&pod_name)).await?.is_some() {
            return Err(Error::PodError(format!(
                "worker pod {pod_name} still terminating"
            )));
        }

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeletePolecat".into(),
                note: Some(format!("Delete `{}`", self.name_any())),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }

    /// Publish an event only on the reconcile that changes the phase, so
    /// steady-state passes stay quiet.
    async fn publish_once(&self, ctx: &Context, reason: &str, note: &str) -> Result<()> {
        let already = match reason {
            "WorkComplete" => {
                self.status.as_ref().map(|s| s.phase == PolecatPhase::Done).unwrap_or(false)
            }
            "PodFailed" => {
                self.status.as_ref().map(|s| s.phase == PolecatPhase::Stuck).unwrap_or(false)
            }
            _ => false,
        };
        if already {
            return Ok(());
        }
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: if reason == "PodFailed" {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: reason.into(),
                note: Some(note.into()),
                action: "Working".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

// Tests rely on fixtures.rs
#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::{timeout_after_1s, Scenario};

    #[test]
    fn pod_phase_mapping_follows_the_table() {
        let pending = assess_pod_phase(Some("Pending"));
        assert_eq!(pending.phase, PolecatPhase::Working);
        assert!(pending.progressing && !pending.available && !pending.degraded);
        assert!(!pending.pod_active);

        let running = assess_pod_phase(Some("Running"));
        assert_eq!(running.phase, PolecatPhase::Working);
        assert!(running.pod_active);

        let succeeded = assess_pod_phase(Some("Succeeded"));
        assert_eq!(succeeded.phase, PolecatPhase::Done);
        assert!(succeeded.available && !succeeded.progressing && !succeeded.degraded);
        assert_eq!(succeeded.reason, "WorkComplete");

        let failed = assess_pod_phase(Some("Failed"));
        assert_eq!(failed.phase, PolecatPhase::Stuck);
        assert!(failed.degraded && !failed.available && !failed.progressing);
    }

    #[test]
    fn conditions_carry_legacy_pair() {
        let polecat = Polecat::test();
        let mut status = PolecatStatus::default();
        polecat.apply_worker_conditions(&mut status, &assess_pod_phase(Some("Succeeded")));
        let types: Vec<_> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
        for expected in [TYPE_AVAILABLE, TYPE_PROGRESSING, TYPE_DEGRADED, TYPE_READY, TYPE_WORKING] {
            assert!(types.contains(&expected), "missing {expected}");
        }
        let ready = crate::conditions::get_condition(&status.conditions, TYPE_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, REASON_POD_SUCCEEDED);
        // no duplicate types
        let mut deduped = types.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), types.len());
    }

    #[tokio::test]
    async fn new_polecats_without_finalizers_get_a_finalizer() {
        let (testctx, fakeserver) = Context::test();
        let polecat = Polecat::test();
        let mocksrv = fakeserver.run(Scenario::PolecatFinalizerCreation(polecat.clone()));
        reconcile(Arc::new(polecat), testctx)
            .await
            .expect("initial creation succeeds in adding finalizer");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deleted_polecats_reap_their_pod_before_dropping_the_finalizer() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
        use kube::Resource;

        let (testctx, fakeserver) = Context::test();
        let mut polecat = Polecat::test().finalized();
        polecat.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        let mocksrv = fakeserver.run(Scenario::PolecatCleanup(
            "DeletePolecat".to_string(),
            polecat.clone(),
        ));
        reconcile(Arc::new(polecat), testctx)
            .await
            .expect("cleanup deletes the pod then clears the finalizer");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn missing_template_marks_polecat_stuck() {
        let (testctx, fakeserver) = Context::test();
        let mut polecat = Polecat::test().finalized();
        polecat.spec.kubernetes = None;
        let mocksrv = fakeserver.run(Scenario::PolecatStatusPatch(polecat.clone()));
        let action = reconcile(Arc::new(polecat), testctx)
            .await
            .expect("reconcile settles with a status write");
        timeout_after_1s(mocksrv).await;
        assert_eq!(action, Action::requeue(REQUEUE_LONG));
    }
}
