use chrono::Utc;
use futures::stream::StreamExt;
use k8s_openapi::api::{
    coordination::v1::{Lease, LeaseSpec},
    core::v1::Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Config as controllerConfig, Controller},
        events::{Recorder, Reporter},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::{fmt::Debug, future::Future, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock},
    time::Duration,
};
use tracing::*;

use crate::{
    apis::{
        beadstore_types::BeadStore, convoy_types::Convoy, polecat_types::Polecat,
        refinery_types::Refinery, rig_types::Rig, witness_types::Witness,
    },
    beadstore, convoy,
    escalation::EscalationBreaker,
    mail::{mailer_from_config, Mailer},
    polecat, refinery, rig, witness, Config, Error, Metrics, Result,
};

pub static RIG_FINALIZER: &str = "gastown.io/rig-cleanup";
pub static POLECAT_FINALIZER: &str = "gastown.io/polecat-cleanup";
pub static BEADSTORE_FINALIZER: &str = "gastown.io/beadstore-cleanup";

pub const LABEL_RIG: &str = "rig";
pub const LABEL_POLECAT: &str = "polecat";
pub const LABEL_BEAD: &str = "bead";
pub const LABEL_RIG_OWNER: &str = "rig-owner";

pub const API_VERSION: &str = "gastown.io/v1alpha1";

/// Requeue vocabulary shared by all six controllers.
pub const REQUEUE_SHORT: Duration = Duration::from_secs(10);
pub const REQUEUE_DEFAULT: Duration = Duration::from_secs(30);
pub const REQUEUE_LONG: Duration = Duration::from_secs(60);
/// Keep draining while a merge queue is non-empty.
pub const REQUEUE_DRAIN: Duration = Duration::from_secs(5);

/// Budget for any single external call made from a reconcile body.
pub const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub fn requeue_long_with_jitter() -> Action {
    let jitter = rand::thread_rng().gen_range(0..30);
    Action::requeue(REQUEUE_LONG + Duration::from_secs(jitter))
}

/// Bound an external call by the shared timeout; an elapsed timer surfaces
/// as an error and rides the rate-limited requeue.
pub async fn with_timeout<T, E, F>(what: &str, fut: F) -> Result<T>
where
    E: Into<Error>,
    F: Future<Output = std::result::Result<T, E>>,
{
    match tokio::time::timeout(EXTERNAL_CALL_TIMEOUT, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Error::TimeoutError(what.to_owned())),
    }
}

/// Backoff used by every error_policy; 429s get extra headroom.
pub fn backoff_requeue(error: &Error) -> Action {
    match error {
        Error::KubeError(kube::Error::Api(api_error)) if api_error.code == 429 => {
            let jitter: u64 = rand::thread_rng().gen_range(0..=120);
            let backoff_with_jitter = Duration::from_secs(60 + jitter);
            warn!(
                "Received HTTP 429 Too Many Requests. Requeuing after {} seconds.",
                backoff_with_jitter.as_secs()
            );
            Action::requeue(backoff_with_jitter)
        }
        _ => Action::requeue(REQUEUE_LONG),
    }
}

/// Server-side apply of a controller-owned status object.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, kind: &str, status: &S) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = Patch::Apply(json!({
        "apiVersion": API_VERSION,
        "kind": kind,
        "status": status,
    }));
    let ps = PatchParams::apply("cntrlr").force();
    with_timeout(
        "status patch",
        api.patch_status(name, &ps, &patch),
    )
    .await?;
    Ok(())
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Process-level configuration
    pub config: Config,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Notification channel for escalations and convoy completions
    pub mailer: Arc<dyn Mailer>,
    /// Escalation circuit breaker, keyed per witness
    pub breaker: Arc<Mutex<EscalationBreaker>>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: chrono::DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "gastown-controller".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder<K>(&self, client: Client, obj: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_utf8(&self.registry.gather(), &mut buffer)
            .expect("encode metrics");
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        let config = Config::default();
        let mailer = mailer_from_config(&config);
        Arc::new(Context {
            client,
            config,
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::default().register(&self.registry).unwrap(),
            mailer,
            breaker: Arc::new(Mutex::new(EscalationBreaker::default())),
        })
    }
}

/// Initialize the six controllers and block until shutdown (given the CRDs
/// are installed). With leader election enabled only the Lease holder
/// reconciles; losing the Lease aborts all in-flight work.
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("Please configure your Kubernetes Context");

    let rigs = Api::<Rig>::all(client.clone());
    if let Err(e) = rigs.list(&ListParams::default().limit(1)).await {
        error!("CRDs are not queryable; {e:?}. Are the CRDs installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let config = Config::default();
    if !config.enable_leader_election {
        run_controllers(client, &state).await;
        return;
    }

    // Only the Lease holder runs; on leadership loss the controller task is
    // aborted and this replica returns to standby.
    let leases: Api<Lease> = Api::namespaced(client.clone(), &config.operator_namespace);
    let identity = leader_identity();
    let mut controllers: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Some(task) = controllers.take() {
                    task.abort();
                }
                return;
            }
            _ = tick.tick() => {}
        }
        match try_acquire_or_renew(&leases, &identity).await {
            Ok(true) => {
                if controllers.is_none() {
                    info!("acquired leadership as {identity}; starting controllers");
                    let client = client.clone();
                    let state = state.clone();
                    controllers = Some(tokio::spawn(async move {
                        run_controllers(client, &state).await;
                    }));
                }
            }
            Ok(false) => {
                if let Some(task) = controllers.take() {
                    warn!("lost leadership; stopping controllers");
                    task.abort();
                }
            }
            Err(e) => {
                // If the apiserver is unreachable we cannot prove we still
                // hold the Lease, so stop reconciling.
                warn!("leader election renew/acquire failed: {e}");
                if let Some(task) = controllers.take() {
                    task.abort();
                }
            }
        }
    }
}

async fn run_controllers(client: Client, state: &State) {
    let ctx = state.create_context(client.clone());

    let rig_controller = Controller::new(
        Api::<Rig>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .with_config(controllerConfig::default().concurrency(3))
    .shutdown_on_signal()
    .run(rig::reconcile, rig::error_policy, ctx.clone())
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    let polecat_controller = Controller::new(
        Api::<Polecat>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .owns(Api::<Pod>::all(client.clone()), watcherConfig::default())
    .with_config(controllerConfig::default().concurrency(5))
    .shutdown_on_signal()
    .run(polecat::reconcile, polecat::error_policy, ctx.clone())
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    let convoy_controller = Controller::new(
        Api::<Convoy>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .with_config(controllerConfig::default().concurrency(3))
    .shutdown_on_signal()
    .run(convoy::reconcile, convoy::error_policy, ctx.clone())
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    let witness_controller = Controller::new(
        Api::<Witness>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .with_config(controllerConfig::default().concurrency(2))
    .shutdown_on_signal()
    .run(witness::reconcile, witness::error_policy, ctx.clone())
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    let refinery_controller = Controller::new(
        Api::<Refinery>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .with_config(controllerConfig::default().concurrency(2))
    .shutdown_on_signal()
    .run(refinery::reconcile, refinery::error_policy, ctx.clone())
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    let beadstore_controller = Controller::new(
        Api::<BeadStore>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .with_config(controllerConfig::default().concurrency(1))
    .shutdown_on_signal()
    .run(beadstore::reconcile, beadstore::error_policy, ctx)
    .filter_map(|x| async move { x.ok() })
    .for_each(|_| futures::future::ready(()));

    tokio::join!(
        rig_controller,
        polecat_controller,
        convoy_controller,
        witness_controller,
        refinery_controller,
        beadstore_controller,
    );
}

fn leader_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("gastown-operator-{}", std::process::id()))
}

const LEASE_NAME: &str = "gastown-operator-lock";
const LEASE_TTL_SECONDS: i32 = 15;

/// Lease acquisition against coordination.k8s.io. Returns whether this
/// replica currently holds the Lease.
async fn try_acquire_or_renew(leases: &Api<Lease>, identity: &str) -> Result<bool> {
    let now = MicroTime(Utc::now());
    match leases.get_opt(LEASE_NAME).await? {
        None => {
            let lease = Lease {
                metadata: kube::api::ObjectMeta {
                    name: Some(LEASE_NAME.to_owned()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_owned()),
                    lease_duration_seconds: Some(LEASE_TTL_SECONDS),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Another replica created it between our get and create.
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Some(mut lease) => {
            let spec = lease.spec.get_or_insert_with(Default::default);
            let held_by_us = spec.holder_identity.as_deref() == Some(identity);
            let expired = spec
                .renew_time
                .as_ref()
                .map(|t| {
                    let age = Utc::now().signed_duration_since(t.0);
                    age.num_seconds() > spec.lease_duration_seconds.unwrap_or(LEASE_TTL_SECONDS) as i64
                })
                .unwrap_or(true);
            if !held_by_us && !expired {
                return Ok(false);
            }
            if !held_by_us {
                spec.holder_identity = Some(identity.to_owned());
                spec.acquire_time = Some(now.clone());
                spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            }
            spec.renew_time = Some(now);
            spec.lease_duration_seconds = Some(LEASE_TTL_SECONDS);
            // The resourceVersion carried in the object makes this a
            // conflict-checked update; losing the race means not leading.
            match leases.replace(LEASE_NAME, &PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}
