//! Helper methods only available for tests
use crate::{
    apis::polecat_types::{Polecat, PolecatKubernetesSpec, PolecatSpec, PolecatStatus},
    apis::rig_types::{Rig, RigSpec},
    escalation::EscalationBreaker,
    mail::LogMailer,
    Config, Context, Metrics, POLECAT_FINALIZER, RIG_FINALIZER,
};
use assert_json_diff::assert_json_include;
use http::{Request, Response};
use hyper::Body;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

impl Polecat {
    /// A normal test Polecat
    pub fn test() -> Self {
        let mut pc = Polecat::new(
            "furiosa",
            PolecatSpec {
                rig: "athena".to_owned(),
                beadID: "at-1234".to_owned(),
                kubernetes: Some(PolecatKubernetesSpec {
                    gitRepository: "git@github.com:org/repo.git".to_owned(),
                    gitSecretRef: "git-creds".to_owned(),
                    claudeCredsSecretRef: "claude-creds".to_owned(),
                    ..PolecatKubernetesSpec::default()
                }),
                ..PolecatSpec::default()
            },
        );
        pc.meta_mut().namespace = Some("testns".into());
        pc.meta_mut().uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        pc
    }

    /// Modify a polecat to have the expected finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(POLECAT_FINALIZER.to_string());
        self
    }

    /// Modify a polecat to have an expected status
    pub fn with_status(mut self, status: PolecatStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Rig {
    /// A normal test Rig; rigs are cluster scoped so no namespace is set
    pub fn test() -> Self {
        let mut rig = Rig::new(
            "athena",
            RigSpec {
                gitURL: "git@x:o/r.git".to_owned(),
                beadsPrefix: "at".to_owned(),
                targetBranch: crate::defaults::default_target_branch(),
            },
        );
        rig.meta_mut().uid = Some("b2b8f5ee-6f8a-4aa0-b6a1-1f54c0f7a1aa".into());
        rig
    }

    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(RIG_FINALIZER.to_string());
        self
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// polecats without finalizers get a finalizer applied (and no apply loop runs)
    PolecatFinalizerCreation(Polecat),
    /// a finalized polecat settles with a single status patch
    PolecatStatusPatch(Polecat),
    /// a deleted polecat reaps its pod, publishes an event, then drops the finalizer
    PolecatCleanup(String, Polecat),
    /// rigs without finalizers get a finalizer applied
    RigFinalizerCreation(Rig),
    /// the controller makes no api calls at all
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
///
impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// NB: If the controller is making more calls than the scenario
    /// handles, you will see a `KubeError(Service(Closed(())))` from the
    /// reconciler. Await the returned JoinHandle (with a timeout) to catch
    /// missing api calls.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::PolecatFinalizerCreation(polecat) => {
                    self.handle_polecat_finalizer_creation(polecat).await
                }
                Scenario::PolecatStatusPatch(polecat) => {
                    self.handle_polecat_status_patch(polecat).await
                }
                Scenario::PolecatCleanup(reason, polecat) => {
                    self.handle_pod_delete_not_found()
                        .await
                        .unwrap()
                        .handle_pod_get_not_found()
                        .await
                        .unwrap()
                        .handle_event_create(reason)
                        .await
                        .unwrap()
                        .handle_polecat_finalizer_removal(polecat)
                        .await
                }
                Scenario::RigFinalizerCreation(rig) => self.handle_rig_finalizer_creation(rig).await,
                Scenario::RadioSilence => Ok(self),
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_polecat_finalizer_creation(mut self, polecat: Polecat) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified polecat adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/gastown.io/v1alpha1/namespaces/testns/polecats/{}?",
                polecat.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![POLECAT_FINALIZER] }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid polecat from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&polecat.finalized()).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_rig_finalizer_creation(mut self, rig: Rig) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        // cluster scoped, so no namespace segment
        assert_eq!(
            request.uri().to_string(),
            format!("/apis/gastown.io/v1alpha1/rigs/{}?", rig.name_any())
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![RIG_FINALIZER] }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid rig from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&rig.finalized()).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    fn not_found_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404
        }))
        .unwrap()
    }

    async fn handle_pod_delete_not_found(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::DELETE);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/testns/pods/polecat-furiosa"
        );
        send.send_response(
            Response::builder()
                .status(404)
                .body(Body::from(Self::not_found_body()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_pod_get_not_found(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/testns/pods/polecat-furiosa"
        );
        send.send_response(
            Response::builder()
                .status(404)
                .body(Body::from(Self::not_found_body()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_event_create(mut self, reason: String) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert!(
            request
                .uri()
                .to_string()
                .starts_with("/apis/events.k8s.io/v1/namespaces/testns/events"),
            "expected an event create, got {}",
            request.uri()
        );
        // verify the event reason matches the expected
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let postdata: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid event from runtime");
        assert_eq!(
            postdata.get("reason").unwrap().as_str().map(String::from),
            Some(reason)
        );
        // then pass through the body
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }

    async fn handle_polecat_finalizer_removal(mut self, polecat: Polecat) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified polecat removing our finalizer (at index 0)
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/gastown.io/v1alpha1/namespaces/testns/polecats/{}?",
                polecat.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers/0", "value": POLECAT_FINALIZER },
            { "op": "remove", "path": "/metadata/finalizers/0" }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid polecat from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&polecat).unwrap(); // respond as the apiserver would have
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_polecat_status_patch(mut self, polecat: Polecat) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/gastown.io/v1alpha1/namespaces/testns/polecats/{}/status?&force=true&fieldManager=cntrlr",
                polecat.name_any()
            )
        );
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("patch_status object is json");
        let status_json = json.get("status").expect("status object").clone();
        let status: PolecatStatus = serde_json::from_value(status_json).expect("valid status");

        let response = serde_json::to_vec(&polecat.with_status(status)).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }
}

impl Context {
    // Create a test context with a mocked kube client, unregistered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let ctx = Self {
            client: mock_client,
            config: Config::default(),
            diagnostics: Arc::new(RwLock::new(Default::default())),
            metrics: Metrics::default(),
            mailer: Arc::new(LogMailer),
            breaker: Arc::new(Mutex::new(EscalationBreaker::default())),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
