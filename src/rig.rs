//! Rig controller: auto-provisions the per-rig Witness/Refinery/BeadStore
//! children, aggregates worker counts, and tears the children down on
//! delete. Rigs are cluster-scoped while children are namespaced, so the
//! fabric's owner references cannot be used; ownership is carried by the
//! `rig-owner` label and enforced by the finalizer.

use crate::{
    apis::{
        beadstore_types::{BeadStore, BeadStoreSpec},
        convoy_types::{Convoy, ConvoyPhase},
        polecat_types::Polecat,
        refinery_types::{Refinery, RefinerySpec},
        rig_types::{Rig, RigPhase, RigStatus},
        witness_types::{Witness, WitnessSpec},
    },
    conditions::{new_condition, set_condition, TYPE_READY},
    controller::{
        backoff_requeue, patch_status, with_timeout, Context, LABEL_RIG, LABEL_RIG_OWNER,
        REQUEUE_DEFAULT, RIG_FINALIZER,
    },
    defaults, telemetry, Error, Result,
};
use chrono::Utc;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::*;

pub static CONTROLLER_NAME: &str = "rig";

#[instrument(skip(ctx, rig), fields(trace_id))]
pub async fn reconcile(rig: Arc<Rig>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER_NAME);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let rigs: Api<Rig> = Api::all(ctx.client.clone());

    debug!("Reconciling Rig \"{}\"", rig.name_any());
    finalizer(&rigs, RIG_FINALIZER, rig, |event| async {
        match event {
            Finalizer::Apply(rig) => rig.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(rig) => rig.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub(crate) fn error_policy(rig: Arc<Rig>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER_NAME, &rig.name_any(), error);
    backoff_requeue(error)
}

fn child_labels(rig_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_RIG_OWNER.to_owned(), rig_name.to_owned()),
        (LABEL_RIG.to_owned(), rig_name.to_owned()),
        ("managed-by".to_owned(), crate::workerpod::MANAGED_BY.to_owned()),
    ])
}

pub fn witness_for_rig(rig: &Rig, namespace: &str) -> Witness {
    let name = rig.name_any();
    Witness {
        metadata: ObjectMeta {
            name: Some(format!("{name}-witness")),
            namespace: Some(namespace.to_owned()),
            labels: Some(child_labels(&name)),
            ..ObjectMeta::default()
        },
        spec: WitnessSpec {
            rigRef: name,
            healthCheckInterval: defaults::default_health_check_interval(),
            stuckThreshold: defaults::default_stuck_threshold(),
            escalationTarget: Default::default(),
        },
        status: None,
    }
}

pub fn refinery_for_rig(rig: &Rig, namespace: &str) -> Refinery {
    let name = rig.name_any();
    Refinery {
        metadata: ObjectMeta {
            name: Some(format!("{name}-refinery")),
            namespace: Some(namespace.to_owned()),
            labels: Some(child_labels(&name)),
            ..ObjectMeta::default()
        },
        spec: RefinerySpec {
            rigRef: name,
            targetBranch: rig.spec.targetBranch.clone(),
            testCommand: None,
            parallelism: defaults::default_parallelism(),
            deleteBranchOnMerge: defaults::default_delete_branch_on_merge(),
        },
        status: None,
    }
}

pub fn beadstore_for_rig(rig: &Rig, namespace: &str) -> BeadStore {
    let name = rig.name_any();
    BeadStore {
        metadata: ObjectMeta {
            name: Some(format!("{name}-beads")),
            namespace: Some(namespace.to_owned()),
            labels: Some(child_labels(&name)),
            ..ObjectMeta::default()
        },
        spec: BeadStoreSpec {
            rigRef: name,
            prefix: rig.spec.beadsPrefix.clone(),
            syncInterval: defaults::default_sync_interval(),
        },
        status: None,
    }
}

/// Create a child object, treating AlreadyExists as success (another
/// reconcile won the race).
async fn create_child<K>(api: &Api<K>, child: &K, what: &str) -> Result<bool>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match with_timeout(what, api.create(&PostParams::default(), child)).await {
        Ok(_) => Ok(true),
        Err(Error::KubeError(kube::Error::Api(e))) if e.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}

impl Rig {
    async fn write_status(&self, ctx: &Context, status: RigStatus) -> Result<()> {
        if self.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let rigs: Api<Rig> = Api::all(ctx.client.clone());
        patch_status(&rigs, &self.name_any(), "Rig", &status).await
    }

    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let child_ns = ctx.config.child_namespace.clone();
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);

        let mut status = self.status.clone().unwrap_or_default();
        status.childNamespace = Some(child_ns.clone());

        if !status.witnessCreated {
            let witnesses: Api<Witness> = Api::namespaced(ctx.client.clone(), &child_ns);
            if create_child(&witnesses, &witness_for_rig(self, &child_ns), "witness create").await? {
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "ProvisionedWitness".into(),
                        note: Some(format!("Created `{name}-witness` in {child_ns}")),
                        action: "Provisioning".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            status.witnessCreated = true;
        }

        if !status.refineryCreated {
            let refineries: Api<Refinery> = Api::namespaced(ctx.client.clone(), &child_ns);
            if create_child(&refineries, &refinery_for_rig(self, &child_ns), "refinery create").await? {
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "ProvisionedRefinery".into(),
                        note: Some(format!("Created `{name}-refinery` in {child_ns}")),
                        action: "Provisioning".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            status.refineryCreated = true;
        }

        // The issue-store sync rides along with the other children; its
        // creation is guarded by existence rather than a status flag.
        let beadstores: Api<BeadStore> = Api::namespaced(ctx.client.clone(), &child_ns);
        if with_timeout("beadstore lookup", beadstores.get_opt(&format!("{name}-beads")))
            .await?
            .is_none()
            && create_child(&beadstores, &beadstore_for_rig(self, &child_ns), "beadstore create")
                .await?
        {
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "ProvisionedBeadStore".into(),
                    note: Some(format!("Created `{name}-beads` in {child_ns}")),
                    action: "Provisioning".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
        }

        // Aggregate counts. A failing list means the cache or index is not
        // usable yet; degrade and try again rather than failing open.
        let polecats: Api<Polecat> = Api::all(ctx.client.clone());
        let convoys: Api<Convoy> = Api::all(ctx.client.clone());
        let polecat_list = with_timeout("polecat list", polecats.list(&ListParams::default())).await;
        let convoy_list = with_timeout("convoy list", convoys.list(&ListParams::default())).await;
        match (polecat_list, convoy_list) {
            (Ok(polecat_list), Ok(convoy_list)) => {
                status.activePolecats = polecat_list
                    .items
                    .iter()
                    .filter(|pc| pc.spec.rig == name)
                    .count() as i32;
                let prefix = format!("{}-", self.spec.beadsPrefix);
                status.activeConvoys = convoy_list
                    .items
                    .iter()
                    .filter(|cv| {
                        cv.status.as_ref().map(|s| s.phase != ConvoyPhase::Complete).unwrap_or(true)
                            && cv.spec.trackedBeads.iter().any(|b| b.starts_with(&prefix))
                    })
                    .count() as i32;
                status.phase = if status.witnessCreated && status.refineryCreated {
                    RigPhase::Ready
                } else {
                    RigPhase::Degraded
                };
                set_condition(
                    &mut status.conditions,
                    new_condition(
                        TYPE_READY,
                        status.phase == RigPhase::Ready,
                        "Provisioned",
                        "",
                        self.metadata.generation,
                    ),
                );
            }
            (polecat_list, convoy_list) => {
                let cause = polecat_list.err().or_else(|| convoy_list.err());
                warn!(
                    "rig {} cannot list children: {}",
                    name,
                    cause.map(|e| e.to_string()).unwrap_or_default()
                );
                status.phase = RigPhase::Degraded;
                set_condition(
                    &mut status.conditions,
                    new_condition(
                        TYPE_READY,
                        false,
                        "ListFailed",
                        "child listing is unavailable",
                        self.metadata.generation,
                    ),
                );
            }
        }

        self.write_status(&ctx, status).await?;
        Ok(Action::requeue(REQUEUE_DEFAULT))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let child_ns = self
            .status
            .as_ref()
            .and_then(|s| s.childNamespace.clone())
            .unwrap_or_else(|| ctx.config.child_namespace.clone());
        let selector = ListParams::default().labels(&format!("{LABEL_RIG_OWNER}={name}"));

        let witnesses: Api<Witness> = Api::namespaced(ctx.client.clone(), &child_ns);
        with_timeout(
            "witness cleanup",
            witnesses.delete_collection(&DeleteParams::default(), &selector),
        )
        .await?;
        let refineries: Api<Refinery> = Api::namespaced(ctx.client.clone(), &child_ns);
        with_timeout(
            "refinery cleanup",
            refineries.delete_collection(&DeleteParams::default(), &selector),
        )
        .await?;
        let beadstores: Api<BeadStore> = Api::namespaced(ctx.client.clone(), &child_ns);
        with_timeout(
            "beadstore cleanup",
            beadstores.delete_collection(&DeleteParams::default(), &selector),
        )
        .await?;

        // Polecats reference the rig in spec, not labels; enumerate and
        // delete wherever they live.
        let polecats: Api<Polecat> = Api::all(ctx.client.clone());
        let orphans = with_timeout("polecat list", polecats.list(&ListParams::default())).await?;
        for pc in orphans.items.iter().filter(|pc| pc.spec.rig == name) {
            if let Some(ns) = pc.namespace() {
                let scoped: Api<Polecat> = Api::namespaced(ctx.client.clone(), &ns);
                match with_timeout(
                    "polecat cleanup",
                    scoped.delete(&pc.name_any(), &DeleteParams::default()),
                )
                .await
                {
                    Ok(_) => {}
                    Err(Error::KubeError(kube::Error::Api(e))) if e.code == 404 => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "CleanupComplete".into(),
                note: Some(format!("Removed children of `{name}`")),
                action: "Deleting".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }
}
