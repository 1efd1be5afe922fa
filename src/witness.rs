//! Witness controller: periodically classifies the polecats of one rig,
//! reports a summary, and escalates stuck workers through the mail
//! interface behind a circuit breaker.

use crate::{
    apis::{
        polecat_types::Polecat,
        witness_types::{EscalationTarget, PolecatSummary, Witness, WitnessPhase, WitnessStatus},
    },
    conditions::{
        new_condition, set_condition, stuck_since, work_complete, work_degraded, work_in_progress,
        TYPE_READY,
    },
    controller::{backoff_requeue, patch_status, with_timeout, Context},
    defaults::duration_or,
    escalation::EscalationDecision,
    telemetry, Error, Result,
};
use chrono::{DateTime, Utc};
use kube::{
    api::{Api, ListParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
};
use std::{sync::Arc, time::Duration};
use tracing::*;

pub static CONTROLLER_NAME: &str = "witness";

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerClass {
    Succeeded,
    Running,
    Failed,
    Stuck,
    Unknown,
}

/// Bucket one polecat. A worker carrying both the new triad and the legacy
/// pair lands in exactly one bucket because the triad short-circuits.
pub(crate) fn classify(polecat: &Polecat, threshold: Duration, now: DateTime<Utc>) -> WorkerClass {
    let conditions = polecat
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    if work_complete(conditions) {
        return WorkerClass::Succeeded;
    }
    if work_degraded(conditions) {
        return WorkerClass::Failed;
    }
    if let Some(progressing) = work_in_progress(conditions) {
        return if stuck_since(progressing, threshold, now) {
            WorkerClass::Stuck
        } else {
            WorkerClass::Running
        };
    }
    WorkerClass::Unknown
}

pub(crate) fn summarize(
    polecats: &[Polecat],
    threshold: Duration,
    now: DateTime<Utc>,
) -> (PolecatSummary, Vec<String>) {
    let mut summary = PolecatSummary {
        total: polecats.len() as i32,
        ..PolecatSummary::default()
    };
    let mut stuck_names = Vec::new();
    for pc in polecats {
        match classify(pc, threshold, now) {
            WorkerClass::Succeeded => summary.succeeded += 1,
            WorkerClass::Running => summary.running += 1,
            WorkerClass::Failed => summary.failed += 1,
            WorkerClass::Stuck => {
                summary.stuck += 1;
                stuck_names.push(pc.name_any());
            }
            WorkerClass::Unknown => {}
        }
    }
    (summary, stuck_names)
}

fn phase_for(summary: &PolecatSummary) -> WitnessPhase {
    if summary.stuck > 0 || summary.failed > 0 {
        WitnessPhase::Degraded
    } else if summary.running > 0 {
        WitnessPhase::Active
    } else {
        WitnessPhase::Pending
    }
}

#[instrument(skip(ctx, witness), fields(trace_id))]
pub async fn reconcile(witness: Arc<Witness>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = witness.namespace().unwrap(); // witness is namespace scoped
    let name = witness.name_any();
    let rig = &witness.spec.rigRef;
    let interval = duration_or(witness.spec.healthCheckInterval.as_deref(), DEFAULT_CHECK_INTERVAL);
    let threshold = duration_or(witness.spec.stuckThreshold.as_deref(), DEFAULT_STUCK_THRESHOLD);

    debug!("Reconciling Witness \"{name}\" in {ns}");

    let polecats: Api<Polecat> = Api::all(ctx.client.clone());
    let list = with_timeout("polecat list", polecats.list(&ListParams::default())).await?;
    let observed: Vec<Polecat> = list.items.into_iter().filter(|pc| &pc.spec.rig == rig).collect();

    let now = Utc::now();
    let (summary, stuck_names) = summarize(&observed, threshold, now);
    let phase = phase_for(&summary);

    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), witness.as_ref());
    let breaker_key = format!("{ns}/{name}");

    if summary.failed > 0 {
        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: "PolecatsFailed".into(),
                note: Some(format!("{} polecat(s) report failed workers", summary.failed)),
                action: "Observing".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
    }

    if summary.stuck > 0 {
        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: "StuckPolecats".into(),
                note: Some(format!(
                    "{} polecat(s) stuck past {:?}: {}",
                    summary.stuck,
                    threshold,
                    stuck_names.join(", ")
                )),
                action: "Observing".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;

        let decision = ctx.breaker.lock().await.on_unhealthy(&breaker_key);
        match decision {
            EscalationDecision::Send => {
                escalate(&ctx, &witness, &stuck_names, &recorder).await?;
            }
            EscalationDecision::Tripped => {
                recorder
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "EscalationCircuitBreaker".into(),
                        note: Some(format!(
                            "Escalation suppressed for `{name}` until a healthy cycle"
                        )),
                        action: "Escalating".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            EscalationDecision::Suppressed => {
                debug!("escalation for {breaker_key} suppressed by circuit breaker");
            }
        }
    } else {
        ctx.breaker.lock().await.on_healthy(&breaker_key);
    }

    let mut status = witness.status.clone().unwrap_or_default();
    status.phase = phase;
    status.summary = summary;
    status.lastCheckTime = Some(now.to_rfc3339());
    let degraded = phase == WitnessPhase::Degraded;
    set_condition(
        &mut status.conditions,
        new_condition(
            TYPE_READY,
            !degraded,
            if degraded { "IssuesDetected" } else { "AllHealthy" },
            "",
            witness.metadata.generation,
        ),
    );

    let witnesses: Api<Witness> = Api::namespaced(ctx.client.clone(), &ns);
    patch_status(&witnesses, &name, "Witness", &status).await?;

    Ok(Action::requeue(interval))
}

async fn escalate(
    ctx: &Context,
    witness: &Witness,
    stuck_names: &[String],
    recorder: &kube::runtime::events::Recorder,
) -> Result<()> {
    let rig = &witness.spec.rigRef;
    match witness.spec.escalationTarget {
        EscalationTarget::Mayor => {
            ctx.mailer
                .send(
                    "mayor",
                    &format!("Stuck polecats on rig {rig}"),
                    &format!(
                        "The witness for rig {rig} found stuck workers: {}",
                        stuck_names.join(", ")
                    ),
                )
                .await?;
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "EscalationSent".into(),
                    note: Some(format!("Escalated {} stuck polecat(s) to the mayor", stuck_names.len())),
                    action: "Escalating".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
        }
        target @ (EscalationTarget::Slack | EscalationTarget::Email) => {
            recorder
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "EscalationNotConfigured".into(),
                    note: Some(format!("Escalation target `{target}` is not configured")),
                    action: "Escalating".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
        }
    }
    Ok(())
}

pub(crate) fn error_policy(witness: Arc<Witness>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(CONTROLLER_NAME, &witness.name_any(), error);
    backoff_requeue(error)
}
