//! Cluster resource access for pods and deployments.
//!
//! The orchestrator touches the cluster exclusively through the [`ClusterClient`]
//! capability trait: get, list-by-label, create, update, delete for the two resource
//! kinds, plus bulk delete and readiness waiting for pods. Production code uses
//! [`KubeClusterClient`]; tests use the in-memory, reconciling [`FakeCluster`] so no real
//! cluster is needed.
//!
//! Every entry point accepts an [`OpCtx`]; a context without a deadline is bounded by the
//! client's configured default before the underlying API is called. Read operations
//! report "not found" as a recoverable `None`, never as an error.

mod client;
mod fake;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use podbox_utils::{OpCtx, DEFAULT_READY_POLL_INTERVAL};

use crate::{PodboxError, PodboxResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use fake::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Capability set the orchestrator requires from a cluster backend.
///
/// Update operations are conditional: when the passed resource carries a resource
/// version, a concurrent modification surfaces as a `Conflict` error and the caller is
/// expected to re-read and retry. Delete operations are idempotent: deleting an absent
/// resource is not an error.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a pod, `None` if absent.
    async fn get_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<Option<Pod>>;

    /// Lists pods matching a label selector. An empty selector lists the namespace.
    async fn list_pods(&self, ctx: &OpCtx, namespace: &str, selector: &str)
        -> PodboxResult<Vec<Pod>>;

    /// Creates a pod.
    async fn create_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod>;

    /// Replaces a pod, conditional on its resource version when set.
    async fn update_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod>;

    /// Deletes a pod. Succeeds if the pod is already gone.
    async fn delete_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<()>;

    /// Deletes every pod matching a label selector. An empty selector is rejected before
    /// any cluster call; an unconstrained bulk delete would wipe the namespace.
    async fn delete_pods_by_label(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<()>;

    /// Polls a pod (1-second interval) until its `Ready` condition is true, the timeout
    /// elapses, or the context is cancelled.
    async fn wait_pod_ready(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> PodboxResult<Pod> {
        let start = Instant::now();
        loop {
            if ctx.is_cancelled() {
                return Err(PodboxError::Canceled {
                    operation: format!("wait for pod {} to become ready", name),
                });
            }
            if let Some(pod) = self.get_pod(ctx, namespace, name).await? {
                if pod_is_ready(&pod) {
                    return Ok(pod);
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(PodboxError::Timeout {
                    operation: format!("wait for pod {} to become ready", name),
                    timeout,
                });
            }
            let interval = DEFAULT_READY_POLL_INTERVAL.min(timeout - elapsed);
            if sleep_or_cancelled(ctx, interval).await {
                return Err(PodboxError::Canceled {
                    operation: format!("wait for pod {} to become ready", name),
                });
            }
        }
    }

    /// Fetches a deployment, `None` if absent.
    async fn get_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
    ) -> PodboxResult<Option<Deployment>>;

    /// Lists deployments matching a label selector.
    async fn list_deployments(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<Vec<Deployment>>;

    /// Creates a deployment. Fails with `AlreadyExists` when the name is taken.
    async fn create_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment>;

    /// Replaces a deployment, conditional on its resource version when set.
    async fn update_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment>;

    /// Deletes a deployment. Succeeds if the deployment is already gone.
    async fn delete_deployment(&self, ctx: &OpCtx, namespace: &str, name: &str)
        -> PodboxResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a pod's `Ready` condition is true.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Parses a rendered label selector (`k1=v1,k2=v2`) back into pairs. Used by the
/// in-memory backend; the kube backend passes selectors through verbatim.
pub(crate) fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Whether a label map satisfies every pair of a parsed selector.
pub(crate) fn selector_matches(
    labels: Option<&std::collections::BTreeMap<String, String>>,
    pairs: &[(String, String)],
) -> bool {
    pairs.iter().all(|(k, v)| {
        labels
            .map(|labels| labels.get(k) == Some(v))
            .unwrap_or(false)
    })
}

/// Sleeps for `duration` unless the context is cancelled first. Returns `true` when the
/// sleep was interrupted by cancellation.
pub(crate) async fn sleep_or_cancelled(ctx: &OpCtx, duration: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
