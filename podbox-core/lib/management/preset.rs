//! Preset registry: template lifecycle backed by zero-replica deployments.
//!
//! Each preset is represented as exactly one Deployment whose name is derived from the
//! preset identifier, so lookup never needs a side index. The Deployment's replica count
//! belongs to the compute lifecycle manager; the registry pins it at creation to the
//! number of live computes already carrying the preset's label and preserves it across
//! template updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use podbox_utils::{
    is_valid_label_value, preset_deployment_name, render_selector, OpCtx, APP_COMPUTE, APP_LABEL,
    APP_PRESET, COMPUTE_ID_LABEL, NAME_LABEL, PRESET_ID_LABEL, UPDATED_AT_ANNOTATION,
    VERSION_LABEL,
};

use crate::cluster::ClusterClient;
use crate::config::OrchestratorConfig;
use crate::models::{
    ComputeSpec, DeploymentConditionInfo, DeploymentStatus, PresetFilters, PresetInfo, PresetSpec,
    Resources,
};
use crate::{PodboxError, PodboxResult, ResourceKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Name of the single sandbox container in every preset template.
const CONTAINER_NAME: &str = "sandbox";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// CRUD and projection operations over preset templates.
#[derive(Clone)]
pub struct PresetManager {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<OrchestratorConfig>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PresetManager {
    /// Creates a registry over the given cluster backend.
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Arc<OrchestratorConfig>) -> Self {
        Self { cluster, config }
    }

    /// Validates and materializes a preset as a Deployment.
    ///
    /// The initial replica count is pinned to the number of live computes already
    /// carrying the preset's label, zero for a fresh identifier. Validation failures
    /// return before any cluster call is made.
    pub async fn create_preset(&self, ctx: &OpCtx, spec: &PresetSpec) -> PodboxResult<PresetInfo> {
        Self::validate_preset(spec)
            .map_err(|e| PodboxError::preset(&spec.id, "create_preset", e))?;
        let namespace = self.config.get_namespace();

        let selector = render_selector([(APP_LABEL, APP_COMPUTE), (PRESET_ID_LABEL, spec.id.as_str())]);
        let live = self
            .cluster
            .list_pods(ctx, namespace, &selector)
            .await
            .map_err(|e| PodboxError::preset(&spec.id, "create_preset", e))?
            .iter()
            .filter(|p| is_live_compute(p))
            .count() as i32;

        let body = build_deployment(spec, live, None);
        let stored = self
            .cluster
            .create_deployment(ctx, namespace, &body)
            .await
            .map_err(|e| PodboxError::preset(&spec.id, "create_preset", e))?;
        tracing::info!(
            "created preset {} as deployment {} with {} base replica(s)",
            spec.id,
            preset_deployment_name(&spec.id),
            live
        );
        Ok(project_preset(&stored))
    }

    /// Fetches one preset by identifier.
    pub async fn get_preset(&self, ctx: &OpCtx, preset_id: &str) -> PodboxResult<PresetInfo> {
        let deployment = self.ensure_preset_deployment(ctx, preset_id).await?;
        Ok(project_preset(&deployment))
    }

    /// Lists presets matching the filters.
    pub async fn list_presets(
        &self,
        ctx: &OpCtx,
        filters: &PresetFilters,
    ) -> PodboxResult<Vec<PresetInfo>> {
        let mut pairs: Vec<(&str, &str)> = vec![(APP_LABEL, APP_PRESET)];
        if let Some(preset_id) = &filters.preset_id {
            pairs.push((PRESET_ID_LABEL, preset_id.as_str()));
        }
        for (k, v) in &filters.labels {
            pairs.push((k.as_str(), v.as_str()));
        }
        let selector = render_selector(pairs);
        let deployments = self
            .cluster
            .list_deployments(ctx, self.config.get_namespace(), &selector)
            .await?;
        Ok(deployments
            .iter()
            .map(project_preset)
            .filter(|info| filters.matches(info))
            .collect())
    }

    /// Replaces a preset's template while preserving its live replica count and resource
    /// identity. Updating a template must never silently change how many instances run.
    pub async fn update_preset(
        &self,
        ctx: &OpCtx,
        preset_id: &str,
        spec: &PresetSpec,
    ) -> PodboxResult<PresetInfo> {
        if spec.id != preset_id {
            return Err(PodboxError::preset(
                preset_id,
                "update_preset",
                PodboxError::validation(
                    "spec.id",
                    &spec.id,
                    format!("spec identifier must match the preset being updated ({})", preset_id),
                ),
            ));
        }
        Self::validate_preset(spec)
            .map_err(|e| PodboxError::preset(preset_id, "update_preset", e))?;
        let namespace = self.config.get_namespace();
        let name = preset_deployment_name(preset_id);
        let retries = *self.config.get_conflict_retries();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = self
                .cluster
                .get_deployment(ctx, namespace, &name)
                .await
                .map_err(|e| PodboxError::preset(preset_id, "update_preset", e))?
                .ok_or_else(|| {
                    PodboxError::preset(
                        preset_id,
                        "update_preset",
                        not_found(ResourceKind::Deployment, namespace, &name),
                    )
                })?;
            let replicas = existing
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0);

            let mut body = build_deployment(spec, replicas, Some(Utc::now()));
            body.metadata.resource_version = existing.metadata.resource_version.clone();
            match self
                .cluster
                .update_deployment(ctx, namespace, &body)
                .await
            {
                Ok(stored) => {
                    tracing::info!("updated preset {} (replicas preserved at {})", preset_id, replicas);
                    return Ok(project_preset(&stored));
                }
                Err(err) if err.is_conflict() && attempt < retries => {
                    tracing::debug!("preset {} update conflicted, retrying", preset_id);
                }
                Err(err) => {
                    return Err(PodboxError::preset(preset_id, "update_preset", err));
                }
            }
        }
    }

    /// Deletes a preset's Deployment. Refused while any compute is live against it;
    /// deleting an absent preset is a no-op.
    pub async fn delete_preset(&self, ctx: &OpCtx, preset_id: &str) -> PodboxResult<()> {
        let namespace = self.config.get_namespace();
        let name = preset_deployment_name(preset_id);
        let existing = self
            .cluster
            .get_deployment(ctx, namespace, &name)
            .await
            .map_err(|e| PodboxError::preset(preset_id, "delete_preset", e))?;
        let Some(deployment) = existing else {
            tracing::debug!("preset {} already absent, nothing to delete", preset_id);
            return Ok(());
        };
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        if replicas > 0 {
            return Err(PodboxError::InUse {
                preset_id: preset_id.to_string(),
                replicas,
            });
        }
        self.cluster
            .delete_deployment(ctx, namespace, &name)
            .await
            .map_err(|e| PodboxError::preset(preset_id, "delete_preset", e))?;
        tracing::info!("deleted preset {}", preset_id);
        Ok(())
    }

    /// Checks a spec without touching the cluster. Shared by create and update.
    pub fn validate_preset(spec: &PresetSpec) -> PodboxResult<()> {
        if spec.id.is_empty() {
            return Err(PodboxError::validation(
                "spec.id",
                &spec.id,
                "a preset needs an identifier",
            ));
        }
        if !is_valid_label_value(&spec.id) {
            return Err(PodboxError::validation(
                "spec.id",
                &spec.id,
                "identifier must be label-safe (alphanumerics, '-', '_', '.', at most 63 chars)",
            ));
        }
        if spec.name.is_empty() {
            return Err(PodboxError::validation(
                "spec.name",
                &spec.name,
                "a preset needs a name",
            ));
        }
        if spec.image.is_empty() {
            return Err(PodboxError::validation(
                "spec.image",
                &spec.image,
                "a preset needs a container image",
            ));
        }
        if !spec.version.is_empty() && !is_valid_label_value(&spec.version) {
            return Err(PodboxError::validation(
                "spec.version",
                &spec.version,
                "version must be label-safe",
            ));
        }
        for port in &spec.ports {
            if port.name.is_empty() {
                return Err(PodboxError::validation(
                    "spec.ports",
                    &port.name,
                    "every declared port needs a name",
                ));
            }
            if !(1..=65535).contains(&port.port) {
                return Err(PodboxError::validation(
                    "spec.ports",
                    port.port.to_string(),
                    "port numbers must be in 1..=65535",
                ));
            }
        }
        Ok(())
    }

    /// Produces a [`ComputeSpec`] skeleton bound to a preset. The compute identifier is
    /// filled in later by the compute lifecycle manager; cluster state is not touched
    /// beyond verifying the preset exists.
    pub async fn render_preset(
        &self,
        ctx: &OpCtx,
        preset_id: &str,
        resources: Option<Resources>,
    ) -> PodboxResult<ComputeSpec> {
        self.ensure_preset_deployment(ctx, preset_id).await?;
        Ok(ComputeSpec {
            compute_id: None,
            preset_id: preset_id.to_string(),
            labels: BTreeMap::new(),
            resources,
        })
    }

    /// Returns the preset's backing Deployment or fails. A missing preset is always an
    /// error at this layer. Creation on demand is deliberately not performed.
    pub async fn ensure_preset_deployment(
        &self,
        ctx: &OpCtx,
        preset_id: &str,
    ) -> PodboxResult<Deployment> {
        let namespace = self.config.get_namespace();
        let name = preset_deployment_name(preset_id);
        self.cluster
            .get_deployment(ctx, namespace, &name)
            .await
            .map_err(|e| PodboxError::preset(preset_id, "ensure_preset_deployment", e))?
            .ok_or_else(|| {
                PodboxError::preset(
                    preset_id,
                    "ensure_preset_deployment",
                    not_found(ResourceKind::Deployment, namespace, &name),
                )
            })
    }

    /// Projects the preset Deployment's replica/condition fields into a
    /// [`DeploymentStatus`] without exposing cluster internals.
    pub async fn deployment_status(
        &self,
        ctx: &OpCtx,
        preset_id: &str,
    ) -> PodboxResult<DeploymentStatus> {
        let deployment = self.ensure_preset_deployment(ctx, preset_id).await?;
        let status = deployment.status.unwrap_or_default();
        Ok(DeploymentStatus {
            desired: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0),
            ready: status.ready_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
            updated: status.updated_replicas.unwrap_or(0),
            conditions: status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .map(|c| DeploymentConditionInfo {
                    type_: c.type_,
                    status: c.status,
                    reason: c.reason,
                    message: c.message,
                })
                .collect(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Builds the Deployment body for a preset spec. The selector and pod template carry the
/// compute label family so scaled-up pods are discoverable as computes; the deployment's
/// own labels carry the preset family for registry listing.
fn build_deployment(
    spec: &PresetSpec,
    replicas: i32,
    updated_at: Option<DateTime<Utc>>,
) -> Deployment {
    let mut deployment_labels = spec.labels.clone();
    deployment_labels.insert(APP_LABEL.to_string(), APP_PRESET.to_string());
    deployment_labels.insert(PRESET_ID_LABEL.to_string(), spec.id.clone());
    deployment_labels.insert(NAME_LABEL.to_string(), spec.name.clone());
    deployment_labels.insert(VERSION_LABEL.to_string(), spec.version.clone());

    let mut annotations = spec.annotations.clone();
    if let Some(updated_at) = updated_at {
        annotations.insert(UPDATED_AT_ANNOTATION.to_string(), updated_at.to_rfc3339());
    }

    let mut pod_labels = spec.labels.clone();
    pod_labels.insert(APP_LABEL.to_string(), APP_COMPUTE.to_string());
    pod_labels.insert(PRESET_ID_LABEL.to_string(), spec.id.clone());

    let selector_labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_COMPUTE.to_string()),
        (PRESET_ID_LABEL.to_string(), spec.id.clone()),
    ]);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(spec.pull_policy.as_str().to_string()),
        command: non_empty(&spec.command),
        args: non_empty(&spec.args),
        working_dir: spec.working_dir.clone(),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(
                spec.env
                    .iter()
                    .map(|e| EnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        ports: if spec.ports.is_empty() {
            None
        } else {
            Some(
                spec.ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: Some(p.name.clone()),
                        container_port: p.port,
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        volume_mounts: if spec.volume_mounts.is_empty() {
            None
        } else {
            Some(
                spec.volume_mounts
                    .iter()
                    .map(|m| VolumeMount {
                        name: m.name.clone(),
                        mount_path: m.mount_path.clone(),
                        read_only: Some(m.read_only),
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        resources: spec.resources.as_ref().map(Resources::to_k8s),
        ..Default::default()
    };

    // Mounts are scratch space: each one gets a matching emptyDir volume.
    let volumes = if spec.volume_mounts.is_empty() {
        None
    } else {
        Some(
            spec.volume_mounts
                .iter()
                .map(|m| Volume {
                    name: m.name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                })
                .collect(),
        )
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(preset_deployment_name(&spec.id)),
            labels: Some(deployment_labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Projects a Deployment back into a [`PresetInfo`].
fn project_preset(deployment: &Deployment) -> PresetInfo {
    let labels = deployment.metadata.labels.clone().unwrap_or_default();
    let annotations = deployment.metadata.annotations.clone().unwrap_or_default();
    let deployment_name = deployment.metadata.name.clone().unwrap_or_default();
    let id = labels
        .get(PRESET_ID_LABEL)
        .cloned()
        .unwrap_or_else(|| {
            deployment_name
                .strip_prefix(podbox_utils::PRESET_DEPLOYMENT_PREFIX)
                .unwrap_or(&deployment_name)
                .to_string()
        });
    let updated_at = annotations
        .get(UPDATED_AT_ANNOTATION)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc));

    PresetInfo {
        id,
        name: labels.get(NAME_LABEL).cloned().unwrap_or_default(),
        version: labels.get(VERSION_LABEL).cloned().unwrap_or_default(),
        deployment_name,
        image: deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        replicas: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        created_at: deployment
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0),
        updated_at,
        labels,
        annotations,
    }
}

fn is_live_compute(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(COMPUTE_ID_LABEL))
            .map(|v| !v.is_empty())
            .unwrap_or(false)
}

fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> PodboxError {
    PodboxError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
