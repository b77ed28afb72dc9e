//! Compute lifecycle management.
//!
//! A compute is born by scaling its preset's Deployment up by one and claiming the pod
//! the cluster controller produces: the manager polls for a pod that carries the preset's
//! labels but no compute identity yet, then writes the compute identifier into its labels
//! with an update conditional on the pod's resource version. Losing that update to a
//! concurrent creator is not an error; the poll simply continues with the next
//! candidate. Deletion reverses the dance: delete the pod, scale the Deployment back
//! down.
//!
//! Per instance the manager walks Provisioning (replica increment issued) → Claimed (pod
//! labeled) → Ready (readiness condition observed) → Deleting → Gone. None of that is
//! persisted anywhere but the cluster itself; restarting the process rebuilds all state
//! from one list query.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use podbox_utils::{
    generate_compute_id, is_valid_label_value, preset_deployment_name, render_selector, OpCtx,
    APP_COMPUTE, APP_LABEL, COMPUTE_ID_LABEL, PRESET_ID_LABEL,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{sleep_or_cancelled, ClusterClient};
use crate::config::OrchestratorConfig;
use crate::models::{ComputeFilters, ComputeInfo, ComputeSpec, ComputeStatus};
use crate::{PodboxError, PodboxResult, ResourceKind};

use super::{ComputeCache, PresetManager};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, tracks, and tears down compute instances.
pub struct ComputeManager {
    cluster: Arc<dyn ClusterClient>,
    presets: PresetManager,
    cache: Arc<ComputeCache>,
    config: Arc<OrchestratorConfig>,
    refresh: Mutex<Option<RefreshTask>>,
}

struct RefreshTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputeManager {
    /// Creates a manager over the given cluster backend and preset registry.
    ///
    /// The background cache refresh is not started here; call
    /// [`start_refresh_task`](Self::start_refresh_task) once the manager lives inside a
    /// runtime, and [`shutdown`](Self::shutdown) when tearing it down.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        presets: PresetManager,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            cluster,
            presets,
            cache: Arc::new(ComputeCache::new()),
            config,
            refresh: Mutex::new(None),
        }
    }

    /// The preset registry this manager provisions from.
    pub fn presets(&self) -> &PresetManager {
        &self.presets
    }

    /// Provisions a new compute from a preset.
    ///
    /// Generates a compute identifier when the spec carries none, requires the preset's
    /// Deployment to exist, scales it up by one, and claims the resulting pod. If no pod
    /// could be claimed within the configured budget the Deployment is scaled back down:
    /// a failed creation must leave the preset's replica count unchanged. Cancellation
    /// mid-poll returns promptly and deliberately skips the rollback.
    ///
    /// ## Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use podbox_core::cluster::KubeClusterClient;
    /// use podbox_core::config::OrchestratorConfig;
    /// use podbox_core::management::{ComputeManager, PresetManager};
    /// use podbox_core::models::ComputeSpec;
    /// use podbox_utils::OpCtx;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let cluster = Arc::new(KubeClusterClient::connect().await?);
    ///     let config = Arc::new(OrchestratorConfig::default());
    ///     let presets = PresetManager::new(cluster.clone(), config.clone());
    ///     let manager = ComputeManager::new(cluster, presets, config);
    ///
    ///     let spec = ComputeSpec {
    ///         preset_id: "web-server".to_string(),
    ///         ..Default::default()
    ///     };
    ///     let compute = manager.create_compute(&OpCtx::background(), &spec).await?;
    ///     println!("created compute {} on pod {}", compute.compute_id, compute.pod_name);
    ///     Ok(())
    /// }
    /// ```
    pub async fn create_compute(
        &self,
        ctx: &OpCtx,
        spec: &ComputeSpec,
    ) -> PodboxResult<ComputeInfo> {
        let compute_id = spec
            .compute_id
            .clone()
            .unwrap_or_else(generate_compute_id);
        let wrap = |e: PodboxError| PodboxError::compute(&compute_id, "create_compute", e);

        validate_compute_spec(&compute_id, &spec.preset_id).map_err(wrap)?;
        self.presets
            .ensure_preset_deployment(ctx, &spec.preset_id)
            .await
            .map_err(wrap)?;
        let deployment_name = preset_deployment_name(&spec.preset_id);

        tracing::info!(
            "creating compute {} from preset {}",
            compute_id,
            spec.preset_id
        );
        let (baseline, _) = self
            .mutate_replicas(ctx, &deployment_name, |current| current + 1)
            .await
            .map_err(wrap)?;

        match self
            .claim_pod(ctx, &spec.preset_id, &compute_id, &spec.labels)
            .await
        {
            Ok(info) => {
                tracing::info!("compute {} claimed pod {}", compute_id, info.pod_name);
                self.cache.insert(info.clone());
                Ok(info)
            }
            Err(err) if err.is_canceled() => Err(wrap(err)),
            Err(err) => {
                tracing::warn!(
                    "compute {} creation failed, restoring {} to {} replica(s): {}",
                    compute_id,
                    deployment_name,
                    baseline,
                    err
                );
                // Best effort: a rollback failure is logged but must not mask the
                // original error.
                if let Err(rollback_err) = self
                    .mutate_replicas(ctx, &deployment_name, |current| current - 1)
                    .await
                {
                    tracing::warn!(
                        "rollback of deployment {} failed: {}",
                        deployment_name,
                        rollback_err
                    );
                }
                Err(wrap(err))
            }
        }
    }

    /// Fetches one compute, consulting the cache first.
    pub async fn get_compute(&self, ctx: &OpCtx, compute_id: &str) -> PodboxResult<ComputeInfo> {
        if let Some(hit) = self.cache.get(compute_id) {
            return Ok(hit);
        }
        let info = self
            .fetch_compute(ctx, compute_id)
            .await
            .map_err(|e| PodboxError::compute(compute_id, "get_compute", e))?
            .ok_or_else(|| {
                PodboxError::compute(
                    compute_id,
                    "get_compute",
                    not_found_pod(self.config.get_namespace(), compute_id),
                )
            })?;
        self.cache.insert(info.clone());
        Ok(info)
    }

    /// Lists computes matching the filters.
    ///
    /// Preset and label filters are pushed into the label selector; the phase filter is
    /// applied client-side. Pods without a usable compute identity are skipped rather
    /// than surfaced; they are not valid compute records. Every discovered compute
    /// refreshes the cache, including ones the phase filter then drops.
    pub async fn list_computes(
        &self,
        ctx: &OpCtx,
        filters: &ComputeFilters,
    ) -> PodboxResult<Vec<ComputeInfo>> {
        let mut pairs: Vec<(&str, &str)> = vec![(APP_LABEL, APP_COMPUTE)];
        if let Some(preset_id) = &filters.preset_id {
            pairs.push((PRESET_ID_LABEL, preset_id.as_str()));
        }
        for (k, v) in &filters.labels {
            pairs.push((k.as_str(), v.as_str()));
        }
        let selector = render_selector(pairs);
        let pods = self
            .cluster
            .list_pods(ctx, self.config.get_namespace(), &selector)
            .await?;

        let mut infos = Vec::new();
        for pod in &pods {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            match ComputeInfo::from_pod(pod) {
                Some(info) => {
                    self.cache.insert(info.clone());
                    infos.push(info);
                }
                None => tracing::debug!(
                    "skipping pod {} without compute identity labels",
                    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
                ),
            }
        }
        infos.retain(|info| filters.matches(info));
        Ok(infos)
    }

    /// Tears down one compute: pod deletion plus a replica decrement on the owning
    /// Deployment (never below zero).
    ///
    /// The initial lookup must succeed: deleting an unknown compute is an error at this
    /// layer, even though the underlying pod and deployment deletes are idempotent.
    pub async fn delete_compute(&self, ctx: &OpCtx, compute_id: &str) -> PodboxResult<()> {
        let info = self.get_compute(ctx, compute_id).await?;
        let wrap = |e: PodboxError| PodboxError::compute(compute_id, "delete_compute", e);

        tracing::info!("deleting compute {} (pod {})", compute_id, info.pod_name);
        self.cluster
            .delete_pod(ctx, self.config.get_namespace(), &info.pod_name)
            .await
            .map_err(wrap)?;
        match self
            .mutate_replicas(ctx, &info.deployment_name, |current| current - 1)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => tracing::warn!(
                "deployment {} was gone while deleting compute {}",
                info.deployment_name,
                compute_id
            ),
            Err(err) => return Err(wrap(err)),
        }
        self.cache.remove(compute_id);
        Ok(())
    }

    /// Reads a compute's current status straight from the cluster, refreshing the cache.
    pub async fn get_compute_status(
        &self,
        ctx: &OpCtx,
        compute_id: &str,
    ) -> PodboxResult<ComputeStatus> {
        let info = self
            .fetch_compute(ctx, compute_id)
            .await
            .map_err(|e| PodboxError::compute(compute_id, "get_compute_status", e))?
            .ok_or_else(|| {
                PodboxError::compute(
                    compute_id,
                    "get_compute_status",
                    not_found_pod(self.config.get_namespace(), compute_id),
                )
            })?;
        let status = info.status.clone();
        self.cache.insert(info);
        Ok(status)
    }

    /// Blocks until the compute's pod reports ready, then returns the refreshed record.
    /// Fails with a timeout when the bound elapses first.
    pub async fn wait_for_ready(
        &self,
        ctx: &OpCtx,
        compute_id: &str,
        timeout: std::time::Duration,
    ) -> PodboxResult<ComputeInfo> {
        let wrap = |e: PodboxError| PodboxError::compute(compute_id, "wait_for_ready", e);
        let info = self.get_compute(ctx, compute_id).await?;
        self.cluster
            .wait_pod_ready(ctx, self.config.get_namespace(), &info.pod_name, timeout)
            .await
            .map_err(wrap)?;
        let refreshed = self
            .fetch_compute(ctx, compute_id)
            .await
            .map_err(wrap)?
            .ok_or_else(|| wrap(not_found_pod(self.config.get_namespace(), compute_id)))?;
        self.cache.insert(refreshed.clone());
        Ok(refreshed)
    }

    /// Restarts a compute by deleting only its pod; the Deployment controller recreates
    /// one from the template. The replacement comes up without the per-instance identity
    /// label, so it is re-claimed under the same compute identifier before returning.
    pub async fn restart_compute(
        &self,
        ctx: &OpCtx,
        compute_id: &str,
    ) -> PodboxResult<ComputeInfo> {
        let wrap = |e: PodboxError| PodboxError::compute(compute_id, "restart_compute", e);
        let info = self
            .fetch_compute(ctx, compute_id)
            .await
            .map_err(wrap)?
            .ok_or_else(|| wrap(not_found_pod(self.config.get_namespace(), compute_id)))?;

        // Evict up front so no reader sees the dying pod.
        self.cache.remove(compute_id);
        tracing::info!("restarting compute {} (pod {})", compute_id, info.pod_name);
        self.cluster
            .delete_pod(ctx, self.config.get_namespace(), &info.pod_name)
            .await
            .map_err(wrap)?;

        let refreshed = self
            .claim_pod(ctx, &info.preset_id, compute_id, &Default::default())
            .await
            .map_err(wrap)?;
        tracing::info!(
            "compute {} restarted onto pod {}",
            compute_id,
            refreshed.pod_name
        );
        self.cache.insert(refreshed.clone());
        Ok(refreshed)
    }

    /// Tears down every compute of a preset: scales its Deployment to zero, then bulk
    /// deletes any remaining labeled pods and evicts the matching cache entries.
    pub async fn purge_computes(&self, ctx: &OpCtx, preset_id: &str) -> PodboxResult<()> {
        let deployment_name = preset_deployment_name(preset_id);
        // Scale to zero first so the controller stops replacing what the bulk delete
        // removes.
        match self
            .mutate_replicas(ctx, &deployment_name, |_| 0)
            .await
        {
            Ok((before, _)) => {
                tracing::info!(
                    "purging preset {}: scaled {} from {} to 0",
                    preset_id,
                    deployment_name,
                    before
                )
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!("preset {} has no deployment, purging stray pods", preset_id)
            }
            Err(err) => return Err(err),
        }
        let selector = render_selector([(APP_LABEL, APP_COMPUTE), (PRESET_ID_LABEL, preset_id)]);
        self.cluster
            .delete_pods_by_label(ctx, self.config.get_namespace(), &selector)
            .await?;
        let evicted = self.cache.remove_preset(preset_id);
        tracing::debug!("purge of preset {} evicted {} cached compute(s)", preset_id, evicted);
        Ok(())
    }

    /// Runs one cache refresh: re-discovers every compute in the namespace and updates
    /// the cache. Entries absent from the response are left alone so a concurrent create
    /// is never raced out of the cache. Exposed so tests (and embedders without the
    /// background task) can drive refreshes deterministically.
    pub async fn refresh_cache_once(&self) -> PodboxResult<usize> {
        refresh_cache(self.cluster.as_ref(), &self.cache, self.config.get_namespace()).await
    }

    /// Starts the periodic background cache refresh. A second call while the task is
    /// running is a no-op.
    pub fn start_refresh_task(&self) {
        let mut guard = self.refresh.lock().expect("refresh task slot poisoned");
        if guard.is_some() {
            tracing::debug!("cache refresh task already running");
            return;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let cluster = self.cluster.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let interval = *config.get_cache_refresh_interval();
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match refresh_cache(cluster.as_ref(), &cache, config.get_namespace()).await {
                            Ok(n) => tracing::trace!("cache refresh updated {} compute(s)", n),
                            Err(err) => tracing::warn!("cache refresh failed: {}", err),
                        }
                    }
                }
            }
        });
        *guard = Some(RefreshTask { token, handle });
        tracing::debug!("cache refresh task started");
    }

    /// Stops the background cache refresh and waits for it to wind down.
    pub async fn shutdown(&self) {
        let task = self
            .refresh
            .lock()
            .expect("refresh task slot poisoned")
            .take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
            tracing::debug!("cache refresh task stopped");
        }
    }

    /// Looks a compute up in the cluster by its identity label. `None` when no live pod
    /// carries it.
    async fn fetch_compute(
        &self,
        ctx: &OpCtx,
        compute_id: &str,
    ) -> PodboxResult<Option<ComputeInfo>> {
        let selector = render_selector([(APP_LABEL, APP_COMPUTE), (COMPUTE_ID_LABEL, compute_id)]);
        let pods = self
            .cluster
            .list_pods(ctx, self.config.get_namespace(), &selector)
            .await?;
        Ok(pods
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .find_map(ComputeInfo::from_pod))
    }

    /// Polls for a claimable pod of the preset and writes the compute identifier (plus
    /// any caller label overrides) into its labels. Candidates carry the preset's labels
    /// but no compute identity yet; filtering by the target identifier would match
    /// nothing before the first claim. The claim is conditional on the pod's resource
    /// version; a conflict means a concurrent creator won that pod and the poll moves on.
    async fn claim_pod(
        &self,
        ctx: &OpCtx,
        preset_id: &str,
        compute_id: &str,
        extra_labels: &std::collections::BTreeMap<String, String>,
    ) -> PodboxResult<ComputeInfo> {
        let namespace = self.config.get_namespace();
        let selector = render_selector([(APP_LABEL, APP_COMPUTE), (PRESET_ID_LABEL, preset_id)]);
        let timeout = *self.config.get_create_timeout();
        let interval = *self.config.get_create_poll_interval();
        let operation = || format!("claim pod for compute {}", compute_id);
        let start = Instant::now();

        loop {
            if ctx.is_cancelled() {
                return Err(PodboxError::Canceled {
                    operation: operation(),
                });
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(PodboxError::Timeout {
                    operation: operation(),
                    timeout,
                });
            }

            let pods = self.cluster.list_pods(ctx, namespace, &selector).await?;
            if let Some(mut pod) = pods.into_iter().find(is_claimable) {
                let pod_name = pod.metadata.name.clone().unwrap_or_default();
                let labels = pod.metadata.labels.get_or_insert_with(Default::default);
                for (k, v) in extra_labels {
                    // Identity keys are never overridable.
                    if k != APP_LABEL && k != PRESET_ID_LABEL && k != COMPUTE_ID_LABEL {
                        labels.insert(k.clone(), v.clone());
                    }
                }
                labels.insert(COMPUTE_ID_LABEL.to_string(), compute_id.to_string());
                match self.cluster.update_pod(ctx, namespace, &pod).await {
                    Ok(claimed) => {
                        return ComputeInfo::from_pod(&claimed).ok_or_else(|| {
                            PodboxError::validation(
                                "pod",
                                pod_name,
                                "claimed pod is missing identity labels",
                            )
                        });
                    }
                    Err(err) if err.is_conflict() => {
                        tracing::debug!(
                            "lost claim race for pod {}, looking for another candidate",
                            pod_name
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let remaining = timeout - elapsed;
            if sleep_or_cancelled(ctx, interval.min(remaining)).await {
                return Err(PodboxError::Canceled {
                    operation: operation(),
                });
            }
        }
    }

    /// Applies `f` to the Deployment's replica count with a conditional update, retrying
    /// on conflict up to the configured bound. The result is floored at zero. Returns the
    /// replica count before and after.
    async fn mutate_replicas(
        &self,
        ctx: &OpCtx,
        deployment_name: &str,
        f: impl Fn(i32) -> i32 + Send + Sync,
    ) -> PodboxResult<(i32, i32)> {
        let namespace = self.config.get_namespace();
        let retries = (*self.config.get_conflict_retries()).max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut deployment = self
                .cluster
                .get_deployment(ctx, namespace, deployment_name)
                .await?
                .ok_or_else(|| PodboxError::NotFound {
                    kind: ResourceKind::Deployment,
                    namespace: namespace.to_string(),
                    name: deployment_name.to_string(),
                })?;
            let current = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0);
            let target = f(current).max(0);
            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = Some(target);
            }
            match self
                .cluster
                .update_deployment(ctx, namespace, &deployment)
                .await
            {
                Ok(_) => {
                    tracing::debug!(
                        "scaled deployment {} from {} to {}",
                        deployment_name,
                        current,
                        target
                    );
                    return Ok((current, target));
                }
                Err(err) if err.is_conflict() && attempt < retries => {
                    tracing::debug!(
                        "replica update on {} conflicted, retrying ({}/{})",
                        deployment_name,
                        attempt,
                        retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Re-discovers every compute in the namespace and folds it into the cache. Shared by the
/// background task and [`ComputeManager::refresh_cache_once`].
async fn refresh_cache(
    cluster: &dyn ClusterClient,
    cache: &ComputeCache,
    namespace: &str,
) -> PodboxResult<usize> {
    let ctx = OpCtx::background();
    let selector = render_selector([(APP_LABEL, APP_COMPUTE)]);
    let pods = cluster.list_pods(&ctx, namespace, &selector).await?;
    let mut updated = 0;
    for pod in &pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        if let Some(info) = ComputeInfo::from_pod(pod) {
            cache.insert(info);
            updated += 1;
        }
    }
    Ok(updated)
}

/// A pod is claimable when it is not terminating and carries no compute identity yet.
fn is_claimable(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(COMPUTE_ID_LABEL))
            .map(|v| v.is_empty())
            .unwrap_or(true)
}

fn validate_compute_spec(compute_id: &str, preset_id: &str) -> PodboxResult<()> {
    if preset_id.is_empty() {
        return Err(PodboxError::validation(
            "spec.preset_id",
            preset_id,
            "a compute needs a preset to instantiate",
        ));
    }
    if !is_valid_label_value(preset_id) {
        return Err(PodboxError::validation(
            "spec.preset_id",
            preset_id,
            "preset identifier must be label-safe",
        ));
    }
    if !is_valid_label_value(compute_id) {
        return Err(PodboxError::validation(
            "spec.compute_id",
            compute_id,
            "compute identifier must be label-safe (alphanumerics, '-', '_', '.', at most 63 chars)",
        ));
    }
    Ok(())
}

fn not_found_pod(namespace: &str, compute_id: &str) -> PodboxError {
    PodboxError::NotFound {
        kind: ResourceKind::Pod,
        namespace: namespace.to_string(),
        name: compute_id.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeCluster;
    use crate::models::{ComputePhase, PresetSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig::builder()
            .create_poll_interval(Duration::from_millis(5))
            .create_timeout(Duration::from_millis(200))
            .cache_refresh_interval(Duration::from_millis(20))
            .build()
    }

    fn managers() -> (Arc<FakeCluster>, ComputeManager) {
        let fake = Arc::new(FakeCluster::new());
        let config = Arc::new(fast_config());
        let presets = PresetManager::new(fake.clone(), config.clone());
        let computes = ComputeManager::new(fake.clone(), presets, config);
        (fake, computes)
    }

    async fn seed_preset(manager: &ComputeManager, id: &str) {
        let ctx = OpCtx::background();
        manager
            .presets()
            .create_preset(&ctx, &PresetSpec::new(id, format!("{} sandbox", id), "python:3.12"))
            .await
            .unwrap();
    }

    fn compute_spec(compute_id: &str, preset_id: &str) -> ComputeSpec {
        ComputeSpec {
            compute_id: Some(compute_id.to_string()),
            preset_id: preset_id.to_string(),
            ..Default::default()
        }
    }

    async fn replicas_of(fake: &FakeCluster, name: &str) -> i32 {
        let ctx = OpCtx::background();
        fake.get_deployment(&ctx, "default", name)
            .await
            .unwrap()
            .unwrap()
            .spec
            .unwrap()
            .replicas
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_create_compute_scales_and_claims() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        let info = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        assert_eq!(info.compute_id, "c1");
        assert_eq!(info.preset_id, "py");
        assert_eq!(info.deployment_name, "preset-py");
        assert_eq!(info.status.phase, ComputePhase::Running);
        assert!(info.pod_ip.is_some());
        assert_eq!(replicas_of(&fake, "preset-py").await, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_create_compute_generates_identifier_when_absent() {
        let (_fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        let spec = ComputeSpec {
            compute_id: None,
            preset_id: "py".to_string(),
            ..Default::default()
        };
        let info = manager.create_compute(&ctx, &spec).await.unwrap();
        assert!(info.compute_id.starts_with("compute-"));
        assert!(is_valid_label_value(&info.compute_id));
    }

    #[test_log::test(tokio::test)]
    async fn test_create_compute_applies_label_overrides() {
        let (_fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        let mut spec = compute_spec("c1", "py");
        spec.labels = BTreeMap::from([
            ("tier".to_string(), "gold".to_string()),
            // Identity keys must not be overridable.
            ("presetId".to_string(), "hijacked".to_string()),
        ]);
        let info = manager.create_compute(&ctx, &spec).await.unwrap();
        assert_eq!(info.labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(info.preset_id, "py");

        let filtered = manager
            .list_computes(
                &ctx,
                &ComputeFilters {
                    labels: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].compute_id, "c1");
    }

    #[test_log::test(tokio::test)]
    async fn test_create_compute_requires_existing_preset() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        let err = manager
            .create_compute(&ctx, &compute_spec("c1", "missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        // Nothing was scaled: the only call was the deployment lookup.
        assert_eq!(fake.call_count("update_deployment"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_create_compute_validation_issues_no_cluster_calls() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        let err = manager
            .create_compute(&ctx, &compute_spec("bad id!", "py"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(fake.total_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_create_timeout_rolls_back_replicas() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        // With the controller paused the scale-up never yields a claimable pod.
        fake.pause_reconcile();
        let err = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(replicas_of(&fake, "preset-py").await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_create_claims_survive_conflicts() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        fake.inject_pod_update_conflicts(1);
        let info = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        assert_eq!(info.compute_id, "c1");
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_creates_get_distinct_pods() {
        let (fake, manager) = managers();
        let manager = Arc::new(manager);
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        let a = {
            let manager = manager.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                manager
                    .create_compute(&ctx, &compute_spec("c1", "py"))
                    .await
            })
        };
        let b = {
            let manager = manager.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                manager
                    .create_compute(&ctx, &compute_spec("c2", "py"))
                    .await
            })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_ne!(a.pod_name, b.pod_name);
        assert_eq!(replicas_of(&fake, "preset-py").await, 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_get_compute_uses_cache_then_cluster() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();

        fake.reset_calls();
        let hit = manager.get_compute(&ctx, "c1").await.unwrap();
        assert_eq!(hit.compute_id, "c1");
        assert_eq!(fake.total_calls(), 0);

        // After eviction the lookup goes to the cluster by label.
        manager.cache.remove("c1");
        let refetched = manager.get_compute(&ctx, "c1").await.unwrap();
        assert_eq!(refetched.compute_id, "c1");
        assert!(fake.call_count("list_pods") > 0);

        let missing = manager.get_compute(&ctx, "ghost").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test_log::test(tokio::test)]
    async fn test_list_computes_filters_and_skips_unlabeled_pods() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        seed_preset(&manager, "js").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        manager
            .create_compute(&ctx, &compute_spec("c2", "js"))
            .await
            .unwrap();

        // An impostor pod with the compute app label but no identity.
        let impostor = Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("impostor".to_string()),
                labels: Some(BTreeMap::from([(
                    APP_LABEL.to_string(),
                    APP_COMPUTE.to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: None,
        };
        fake.create_pod(&ctx, "default", &impostor).await.unwrap();

        let all = manager
            .list_computes(&ctx, &ComputeFilters::default())
            .await
            .unwrap();
        let mut ids: Vec<_> = all.iter().map(|i| i.compute_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2"]);

        let py_only = manager
            .list_computes(
                &ctx,
                &ComputeFilters {
                    preset_id: Some("py".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(py_only.len(), 1);
        assert_eq!(py_only[0].compute_id, "c1");

        let running = manager
            .list_computes(
                &ctx,
                &ComputeFilters {
                    phase: Some(ComputePhase::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_get_compute_status_reads_the_cluster() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        let info = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();

        let status = manager.get_compute_status(&ctx, "c1").await.unwrap();
        assert_eq!(status.phase, ComputePhase::Running);
        assert!(status.ready);

        // Flipping readiness on the pod is visible without a cache eviction.
        fake.set_pod_ready("default", &info.pod_name, false);
        let status = manager.get_compute_status(&ctx, "c1").await.unwrap();
        assert!(!status.ready);

        assert!(manager
            .get_compute_status(&ctx, "ghost")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_compute_returns_replicas_to_baseline() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        assert_eq!(replicas_of(&fake, "preset-py").await, 1);

        manager.delete_compute(&ctx, "c1").await.unwrap();
        assert_eq!(replicas_of(&fake, "preset-py").await, 0);

        let err = manager.get_compute(&ctx, "c1").await.unwrap_err();
        assert!(err.is_not_found());

        // Delete-of-unknown-compute is an error, not a no-op.
        let err = manager.delete_compute(&ctx, "c1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_ready_success_and_timeout() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;

        fake.set_auto_ready(false);
        // With pods coming up unready the claim still succeeds (claimability is about
        // labels, not readiness), but the wait must block.
        let info = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        assert!(!info.status.ready);

        let err = manager
            .wait_for_ready(&ctx, "c1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        fake.set_pod_ready("default", &info.pod_name, true);
        let ready = manager
            .wait_for_ready(&ctx, "c1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ready.status.ready);
        assert_eq!(ready.status.phase, ComputePhase::Running);
    }

    #[test_log::test(tokio::test)]
    async fn test_restart_keeps_identity_on_fresh_pod() {
        let (_fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        let before = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();

        let after = manager.restart_compute(&ctx, "c1").await.unwrap();
        assert_eq!(after.compute_id, "c1");
        assert_ne!(after.pod_name, before.pod_name);

        // The restarted compute stays discoverable.
        let found = manager.get_compute(&ctx, "c1").await.unwrap();
        assert_eq!(found.pod_name, after.pod_name);
    }

    #[test_log::test(tokio::test)]
    async fn test_purge_computes_empties_the_pool() {
        let (fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        manager
            .create_compute(&ctx, &compute_spec("c2", "py"))
            .await
            .unwrap();
        assert_eq!(replicas_of(&fake, "preset-py").await, 2);

        manager.purge_computes(&ctx, "py").await.unwrap();
        assert_eq!(replicas_of(&fake, "preset-py").await, 0);
        assert!(manager
            .list_computes(&ctx, &ComputeFilters::default())
            .await
            .unwrap()
            .is_empty());
        assert!(manager.cache.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_cache_refresh_repopulates_after_eviction() {
        let (_fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();

        manager.cache.remove("c1");
        assert!(manager.cache.is_empty());
        let updated = manager.refresh_cache_once().await.unwrap();
        assert_eq!(updated, 1);
        assert!(manager.cache.get("c1").is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_background_refresh_task_lifecycle() {
        let (_fake, manager) = managers();
        let ctx = OpCtx::background();
        seed_preset(&manager, "py").await;
        manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap();
        manager.cache.remove("c1");

        manager.start_refresh_task();
        // Idempotent start.
        manager.start_refresh_task();

        // The 20ms refresh interval repopulates the entry shortly.
        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.cache.get("c1").is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.cache.get("c1").is_some());

        manager.shutdown().await;
        // Shutdown is idempotent too.
        manager.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_cancellation_aborts_create_promptly() {
        let (fake, manager) = managers();
        seed_preset(&manager, "py").await;
        fake.pause_reconcile();

        let ctx = OpCtx::background();
        ctx.cancel();
        let err = manager
            .create_compute(&ctx, &compute_spec("c1", "py"))
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
