//! Kube-backed implementation of the cluster access trait.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use podbox_utils::{OpCtx, DEFAULT_CALL_TIMEOUT};

use crate::{PodboxError, PodboxResult, ResourceKind};

use super::ClusterClient;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Cluster access backed by a real control plane via `kube`.
///
/// Every call is bounded: when the caller's context carries no deadline, the configured
/// default (30 seconds unless overridden) is applied before the API is invoked, and the
/// bound is released when the call returns.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    default_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KubeClusterClient {
    /// Wraps an existing kube client.
    pub fn new(client: Client, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
        }
    }

    /// Connects using the ambient kubeconfig / in-cluster environment, with the default
    /// per-call deadline.
    pub async fn connect() -> PodboxResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|source| PodboxError::ClientInit { source })?;
        Ok(Self::new(client, DEFAULT_CALL_TIMEOUT))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Runs one API call bounded by the context deadline (or the configured default) and
    /// aborted on cancellation. Failures are wrapped with the operation, namespace, and
    /// resource name for diagnosis.
    async fn bounded<T, F>(
        &self,
        ctx: &OpCtx,
        operation: &'static str,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        fut: F,
    ) -> PodboxResult<T>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let budget = ctx.remaining().unwrap_or(self.default_timeout);
        tokio::select! {
            _ = ctx.cancelled() => Err(PodboxError::Canceled {
                operation: format!("{} {}/{}", operation, namespace, name),
            }),
            outcome = tokio::time::timeout(budget, fut) => match outcome {
                Err(_) => Err(PodboxError::Timeout {
                    operation: format!("{} {}/{}", operation, namespace, name),
                    timeout: budget,
                }),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(map_kube_error(err, operation, kind, namespace, name)),
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<Option<Pod>> {
        let api = self.pods(namespace);
        self.bounded(
            ctx,
            "get_pod",
            ResourceKind::Pod,
            namespace,
            name,
            api.get_opt(name),
        )
        .await
    }

    async fn list_pods(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<Vec<Pod>> {
        let api = self.pods(namespace);
        let params = ListParams::default().labels(selector);
        let list = self
            .bounded(
                ctx,
                "list_pods",
                ResourceKind::Pod,
                namespace,
                selector,
                api.list(&params),
            )
            .await?;
        Ok(list.items)
    }

    async fn create_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let api = self.pods(namespace);
        self.bounded(
            ctx,
            "create_pod",
            ResourceKind::Pod,
            namespace,
            &name,
            api.create(&PostParams::default(), pod),
        )
        .await
    }

    async fn update_pod(&self, ctx: &OpCtx, namespace: &str, pod: &Pod) -> PodboxResult<Pod> {
        let name = pod.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation("pod.metadata.name", "", "update requires a named pod")
        })?;
        let api = self.pods(namespace);
        self.bounded(
            ctx,
            "update_pod",
            ResourceKind::Pod,
            namespace,
            &name,
            api.replace(&name, &PostParams::default(), pod),
        )
        .await
    }

    async fn delete_pod(&self, ctx: &OpCtx, namespace: &str, name: &str) -> PodboxResult<()> {
        let api = self.pods(namespace);
        let outcome = self
            .bounded(
                ctx,
                "delete_pod",
                ResourceKind::Pod,
                namespace,
                name,
                api.delete(name, &DeleteParams::default()),
            )
            .await;
        swallow_not_found(outcome.map(|_| ()))
    }

    async fn delete_pods_by_label(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<()> {
        if selector.is_empty() {
            return Err(PodboxError::EmptySelector {
                operation: "delete_pods_by_label",
            });
        }
        let api = self.pods(namespace);
        let params = ListParams::default().labels(selector);
        self.bounded(
            ctx,
            "delete_pods_by_label",
            ResourceKind::Pod,
            namespace,
            selector,
            api.delete_collection(&DeleteParams::default(), &params),
        )
        .await
        .map(|_| ())
    }

    async fn get_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
    ) -> PodboxResult<Option<Deployment>> {
        let api = self.deployments(namespace);
        self.bounded(
            ctx,
            "get_deployment",
            ResourceKind::Deployment,
            namespace,
            name,
            api.get_opt(name),
        )
        .await
    }

    async fn list_deployments(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        selector: &str,
    ) -> PodboxResult<Vec<Deployment>> {
        let api = self.deployments(namespace);
        let params = ListParams::default().labels(selector);
        let list = self
            .bounded(
                ctx,
                "list_deployments",
                ResourceKind::Deployment,
                namespace,
                selector,
                api.list(&params),
            )
            .await?;
        Ok(list.items)
    }

    async fn create_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let api = self.deployments(namespace);
        self.bounded(
            ctx,
            "create_deployment",
            ResourceKind::Deployment,
            namespace,
            &name,
            api.create(&PostParams::default(), deployment),
        )
        .await
    }

    async fn update_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        deployment: &Deployment,
    ) -> PodboxResult<Deployment> {
        let name = deployment.metadata.name.clone().ok_or_else(|| {
            PodboxError::validation(
                "deployment.metadata.name",
                "",
                "update requires a named deployment",
            )
        })?;
        let api = self.deployments(namespace);
        self.bounded(
            ctx,
            "update_deployment",
            ResourceKind::Deployment,
            namespace,
            &name,
            api.replace(&name, &PostParams::default(), deployment),
        )
        .await
    }

    async fn delete_deployment(
        &self,
        ctx: &OpCtx,
        namespace: &str,
        name: &str,
    ) -> PodboxResult<()> {
        let api = self.deployments(namespace);
        let outcome = self
            .bounded(
                ctx,
                "delete_deployment",
                ResourceKind::Deployment,
                namespace,
                name,
                api.delete(name, &DeleteParams::default()),
            )
            .await;
        swallow_not_found(outcome.map(|_| ()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Translates a kube error into the orchestrator's taxonomy: 404 becomes `NotFound`,
/// a 409 becomes `AlreadyExists` or `Conflict` depending on the API's stated reason,
/// everything else is wrapped as a transport failure.
fn map_kube_error(
    err: kube::Error,
    operation: &'static str,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> PodboxError {
    if let kube::Error::Api(response) = &err {
        if response.code == 404 || response.reason == "NotFound" {
            return PodboxError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }
        if response.reason == "AlreadyExists" {
            return PodboxError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }
        if response.code == 409 {
            return PodboxError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }
    }
    PodboxError::Cluster {
        operation,
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        source: err,
    }
}

/// Deletes are idempotent: a not-found outcome is success.
fn swallow_not_found(outcome: PodboxResult<()>) -> PodboxResult<()> {
    match outcome {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
