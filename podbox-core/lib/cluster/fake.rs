//! In-memory cluster backend for tests and local development.
//!
//! `FakeCluster` implements [`ClusterClient`] against plain maps and simulates the part
//! of the deployment controller the orchestrator relies on: scaling a deployment up
//! synthesizes pods from its template, scaling it down removes them (unclaimed pods
//! first), and deleting a pod out from under a deployment gets it recreated. Every call
//! is counted per operation name so tests can assert how many cluster calls a code path
//! issued, including zero.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus as K8sDeploymentStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use podbox_utils::{OpCtx, COMPUTE_ID_LABEL};

use crate::{PodboxError, PodboxResult, ResourceKind};

use super::{parse_selector, selector_matches, ClusterClient};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory control plane with a built-in deployment controller.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    auto_ready: AtomicBool,
    reconcile_paused: AtomicBool,
    pod_update_conflicts: AtomicUsize,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Pod>,
    deployments: BTreeMap<String, Deployment>,
    resource_version: u64,
    pod_seq: u64,
    ip_seq: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeCluster {
    /// Creates an empty fake cluster whose synthesized pods come up ready.
    pub fn new() -> Self {
        let fake = Self::default();
        fake.auto_ready.store(true, Ordering::SeqCst);
        fake
    }

    /// Controls whether synthesized pods start with their `Ready` condition true.
    pub fn set_auto_ready(&self, ready: bool) {
        self.auto_ready.store(ready, Ordering::SeqCst);
    }

    /// Suspends the built-in controller: replica changes stop producing or removing pods
    /// until [`resume_reconcile`](Self::resume_reconcile) runs.
    pub fn pause_reconcile(&self) {
        self.reconcile_paused.store(true, Ordering::SeqCst);
    }

    /// Resumes the built-in controller and reconciles immediately.
    pub fn resume_reconcile(&self) {
        self.reconcile_paused.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        reconcile(&mut state, self.auto_ready.load(Ordering::SeqCst));
    }

    /// Makes the next `n` pod updates fail with a conflict, to exercise claim races.
    pub fn inject_pod_update_conflicts(&self, n: usize) {
        self.pod_update_conflicts.store(n, Ordering::SeqCst);
    }

    /// Flips the `Ready` condition of one pod. Returns false when the pod is absent.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) -> bool {
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        match state.pods.get_mut(&key(namespace, name)) {
            Some(pod) => {
                pod.status = Some(pod_status(ready, &pod_ip_of(pod)));
                true
            }
            None => false,
        }
    }

    /// How many times one trait operation ran.
    pub fn call_count(&self, operation: &str) -> usize {
        *self
            .calls
            .lock()
            .expect("fake cluster call log poisoned")
            .get(operation)
            .unwrap_or(&0)
    }

    /// How many trait operations ran in total.
    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .expect("fake cluster call log poisoned")
            .values()
            .sum()
    }

    /// Clears the call log.
    pub fn reset_calls(&self) {
        self.calls
            .lock()
            .expect("fake cluster call log poisoned")
            .clear();
    }

    /// Names of live pods in a namespace, in creation order.
    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().expect("fake cluster state poisoned");
        let prefix = format!("{}/", namespace);
        state
            .pods
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, operation: &'static str) {
        *self
            .calls
            .lock()
            .expect("fake cluster call log poisoned")
            .entry(operation)
            .or_insert(0) += 1;
    }

    fn check_ctx(&self, ctx: &OpCtx, operation: &str) -> PodboxResult<()> {
        if ctx.is_cancelled() {
            return Err(PodboxError::Canceled {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn maybe_reconcile(&self, state: &mut State) {
        if !self.reconcile_paused.load(Ordering::SeqCst) {
            reconcile(state, self.auto_ready.load(Ordering::SeqCst));
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<Option<Pod>> {
        self.record("get_pod");
        self.check_ctx(ctx, "get_pod")?;
        let state = self.state.lock().expect("fake cluster state poisoned");
        Ok(state.pods.get(&key(namespace, name)).cloned())
    }

    async fn list_pods(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<Vec<Pod>> {
        self.record("list_pods");
        self.check_ctx(ctx, "list_pods")?;
        let pairs = parse_selector(selector);
        let state = self.state.lock().expect("fake cluster state poisoned");
        Ok(state
            .pods
            .values()
            .filter(|p| in_namespace(&p.metadata.namespace, namespace))
            .filter(|p| selector_matches(p.metadata.labels.as_ref(), &pairs))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod> {
        self.record("create_pod");
        self.check_ctx(ctx, "create_pod")?;
        let name = pod.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation("pod.metadata.name", "", "create requires a named pod")
        })?;
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        if state.pods.contains_key(&key(namespace, &name)) {
            return Err(PodboxError::AlreadyExists {
                kind: ResourceKind::Pod,
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = pod.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.pods.insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn update_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod> {
        self.record("update_pod");
        self.check_ctx(ctx, "update_pod")?;
        let name = pod.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation("pod.metadata.name", "", "update requires a named pod")
        })?;
        if self
            .pod_update_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PodboxError::Conflict {
                kind: ResourceKind::Pod,
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        let next_version = state.next_resource_version();
        let existing = state.pods.get_mut(&key(namespace, &name)).ok_or_else(|| {
            PodboxError::NotFound {
                kind: ResourceKind::Pod,
                namespace: namespace.to_string(),
                name: name.clone(),
            }
        })?;
        check_resource_version(
            &existing.metadata.resource_version,
            &pod.metadata.resource_version,
            ResourceKind::Pod,
            namespace,
            &name,
        )?;
        let mut stored = pod.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        stored.metadata.resource_version = Some(next_version);
        // Status is owned by the controller, not the writer.
        stored.status = existing.status.clone();
        *existing = stored.clone();
        Ok(stored)
    }

    async fn delete_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<()> {
        self.record("delete_pod");
        self.check_ctx(ctx, "delete_pod")?;
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        state.pods.remove(&key(namespace, name));
        self.maybe_reconcile(&mut state);
        Ok(())
    }

    async fn delete_pods_by_label(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<()> {
        self.record("delete_pods_by_label");
        self.check_ctx(ctx, "delete_pods_by_label")?;
        if selector.is_empty() {
            return Err(PodboxError::EmptySelector {
                operation: "delete_pods_by_label",
            });
        }
        let pairs = parse_selector(selector);
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        state.pods.retain(|k, p| {
            !(k.starts_with(&format!("{}/", namespace))
                && selector_matches(p.metadata.labels.as_ref(), &pairs))
        });
        self.maybe_reconcile(&mut state);
        Ok(())
    }

    async fn get_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
    ) -> PodboxResult<Option<Deployment>> {
        self.record("get_deployment");
        self.check_ctx(ctx, "get_deployment")?;
        let state = self.state.lock().expect("fake cluster state poisoned");
        Ok(state.deployments.get(&key(namespace, name)).cloned())
    }

    async fn list_deployments(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<Vec<Deployment>> {
        self.record("list_deployments");
        self.check_ctx(ctx, "list_deployments")?;
        let pairs = parse_selector(selector);
        let state = self.state.lock().expect("fake cluster state poisoned");
        Ok(state
            .deployments
            .values()
            .filter(|d| in_namespace(&d.metadata.namespace, namespace))
            .filter(|d| selector_matches(d.metadata.labels.as_ref(), &pairs))
            .cloned()
            .collect())
    }

    async fn create_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment> {
        self.record("create_deployment");
        self.check_ctx(ctx, "create_deployment")?;
        let name = deployment.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation(
                "deployment.metadata.name",
                "",
                "create requires a named deployment",
            )
        })?;
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        if state.deployments.contains_key(&key(namespace, &name)) {
            return Err(PodboxError::AlreadyExists {
                kind: ResourceKind::Deployment,
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = deployment.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.deployments.insert(key(namespace, &name), stored.clone());
        self.maybe_reconcile(&mut state);
        Ok(stored)
    }

    async fn update_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment> {
        self.record("update_deployment");
        self.check_ctx(ctx, "update_deployment")?;
        let name = deployment.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation(
                "deployment.metadata.name",
                "",
                "update requires a named deployment",
            )
        })?;
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        let next_version = state.next_resource_version();
        let existing = state
            .deployments
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| PodboxError::NotFound {
                kind: ResourceKind::Deployment,
                namespace: namespace.to_string(),
                name: name.clone(),
            })?;
        check_resource_version(
            &existing.metadata.resource_version,
            &deployment.metadata.resource_version,
            ResourceKind::Deployment,
            namespace,
            &name,
        )?;
        let mut stored = deployment.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        stored.metadata.resource_version = Some(next_version);
        *existing = stored.clone();
        self.maybe_reconcile(&mut state);
        Ok(stored)
    }

    async fn delete_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
    ) -> PodboxResult<()> {
        self.record("delete_deployment");
        self.check_ctx(ctx, "delete_deployment")?;
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        state.deployments.remove(&key(namespace, name));
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn in_namespace(actual: &Option<String>, wanted: &str) -> bool {
    actual.as_deref().unwrap_or("default") == wanted
}

fn pod_ip_of(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_else(|| "10.244.0.0".to_string())
}

fn pod_status(ready: bool, pod_ip: &str) -> PodStatus {
    PodStatus {
        phase: Some(if ready { "Running" } else { "Pending" }.to_string()),
        pod_ip: Some(pod_ip.to_string()),
        host_ip: Some("10.0.0.1".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Time(Utc::now())),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn is_unclaimed(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(COMPUTE_ID_LABEL))
        .map(|v| v.is_empty())
        .unwrap_or(true)
}

/// The deployment-controller simulation: per deployment, diff desired replicas against
/// matching pods; synthesize pods from the template when short, remove pods (unclaimed
/// first) when over, and refresh the deployment status projection.
fn reconcile(state: &mut State, auto_ready: bool) {
    let deployment_keys: Vec<String> = state.deployments.keys().cloned().collect();
    for deployment_key in deployment_keys {
        let deployment = &state.deployments[&deployment_key];
        let namespace = deployment
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let deployment_name = deployment.metadata.name.clone().unwrap_or_default();
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0)
            .max(0);
        let selector: Vec<(String, String)> = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
            .into_iter()
            .collect();
        let template = deployment
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();

        let matching: Vec<String> = state
            .pods
            .iter()
            .filter(|(k, p)| {
                k.starts_with(&format!("{}/", namespace))
                    && selector_matches(p.metadata.labels.as_ref(), &selector)
            })
            .map(|(k, _)| k.clone())
            .collect();

        let current = matching.len() as i32;
        if current < desired {
            for _ in 0..(desired - current) {
                state.pod_seq += 1;
                state.ip_seq += 1;
                let pod_name = format!("{}-{:05}", deployment_name, state.pod_seq);
                let pod_ip = format!("10.244.0.{}", state.ip_seq);
                let version = state.next_resource_version();
                let pod = Pod {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(pod_name.clone()),
                        namespace: Some(namespace.clone()),
                        labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
                        annotations: template
                            .metadata
                            .as_ref()
                            .and_then(|m| m.annotations.clone()),
                        creation_timestamp: Some(Time(Utc::now())),
                        resource_version: Some(version),
                        ..Default::default()
                    },
                    spec: template.spec.clone(),
                    status: Some(pod_status(auto_ready, &pod_ip)),
                };
                state.pods.insert(key(&namespace, &pod_name), pod);
            }
        } else if current > desired {
            // Scale-down removes unclaimed pods before claimed ones, newest first.
            let (mut unclaimed, mut claimed): (Vec<String>, Vec<String>) = matching
                .into_iter()
                .partition(|k| is_unclaimed(&state.pods[k]));
            unclaimed.sort();
            claimed.sort();
            for _ in 0..(current - desired) {
                if let Some(victim) = unclaimed.pop().or_else(|| claimed.pop()) {
                    state.pods.remove(&victim);
                }
            }
        }

        let ready = state
            .pods
            .iter()
            .filter(|(k, p)| {
                k.starts_with(&format!("{}/", namespace))
                    && selector_matches(p.metadata.labels.as_ref(), &selector)
                    && super::pod_is_ready(p)
            })
            .count() as i32;
        let deployment = state
            .deployments
            .get_mut(&deployment_key)
            .expect("deployment vanished during reconcile");
        deployment.status = Some(K8sDeploymentStatus {
            replicas: Some(desired),
            ready_replicas: Some(ready),
            available_replicas: Some(ready),
            updated_replicas: Some(desired),
            ..Default::default()
        });
    }
}

fn check_resource_version(
    stored: &Option<String>,
    incoming: &Option<String>,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> PodboxResult<()> {
    if let Some(incoming) = incoming {
        if stored.as_ref() != Some(incoming) {
            return Err(PodboxError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
