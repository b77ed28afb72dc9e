//! Compute types: single running sandbox instances and their cluster projections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use podbox_utils::{preset_deployment_name, COMPUTE_ID_LABEL, PRESET_ID_LABEL};
use serde::{Deserialize, Serialize};

use super::Resources;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle phase of a compute's pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputePhase {
    /// The pod is accepted but not all containers are running yet.
    #[default]
    Pending,

    /// All containers are running.
    Running,

    /// All containers terminated successfully.
    Succeeded,

    /// At least one container terminated in failure.
    Failed,

    /// The phase could not be determined.
    Unknown,
}

/// Creation request for a single compute instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeSpec {
    /// Unique compute identifier. Generated when absent.
    pub compute_id: Option<String>,

    /// Identifier of the preset to instantiate.
    pub preset_id: String,

    /// Extra labels written onto the claimed pod alongside the compute identifier.
    /// Reserved identity keys (`app`, `presetId`, `computeId`) are ignored here.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Requested resource overrides. The claimed pod's actual resources win, since pods
    /// are stamped from the shared template; see `ComputeInfo::resources` for the
    /// resolved values.
    pub resources: Option<Resources>,
}

/// A single typed condition reported on a compute's pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeCondition {
    /// Condition type (`Ready`, `PodScheduled`, ...).
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status string (`True`, `False`, `Unknown`).
    pub status: String,

    /// Machine-readable reason, when reported.
    pub reason: Option<String>,

    /// Human-readable message, when reported.
    pub message: Option<String>,

    /// When the condition last flipped.
    pub last_transition: Option<DateTime<Utc>>,
}

/// Point-in-time status of a compute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeStatus {
    /// Lifecycle phase.
    pub phase: ComputePhase,

    /// Whether the pod's `Ready` condition is true.
    pub ready: bool,

    /// Human-readable status message, when reported.
    pub message: Option<String>,

    /// All conditions reported on the pod.
    pub conditions: Vec<ComputeCondition>,
}

/// The materialized state of one compute instance.
///
/// Invariant: `compute_id` and `preset_id` are never empty. A pod lacking either label is
/// not a valid compute and is filtered out during discovery instead of being surfaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeInfo {
    /// Unique compute identifier.
    pub compute_id: String,

    /// Name of the backing pod.
    pub pod_name: String,

    /// Identifier of the owning preset.
    pub preset_id: String,

    /// Name of the owning preset's deployment, derived from the preset identifier.
    pub deployment_name: String,

    /// Current status.
    pub status: ComputeStatus,

    /// Resolved resource requests/limits, read back from the pod.
    pub resources: Resources,

    /// Pod IP, once assigned.
    pub pod_ip: Option<String>,

    /// Host IP, once assigned.
    pub host_ip: Option<String>,

    /// Named port → port number map from the pod's containers.
    pub ports: BTreeMap<String, i32>,

    /// When the pod was created.
    pub created_at: Option<DateTime<Utc>>,

    /// Full label set on the pod.
    pub labels: BTreeMap<String, String>,

    /// Full annotation set on the pod.
    pub annotations: BTreeMap<String, String>,
}

/// Query predicates for listing computes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeFilters {
    /// Restrict to computes of a single preset.
    pub preset_id: Option<String>,

    /// Restrict to computes in a given phase. Applied client-side; phases are not labels.
    pub phase: Option<ComputePhase>,

    /// Labels every returned compute must carry (subset match).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputePhase {
    /// Parses a pod phase string from the cluster API.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl ComputeInfo {
    /// Projects a pod into a compute record.
    ///
    /// Returns `None` when the pod carries no usable `computeId` or `presetId` label;
    /// such a pod is not a valid compute and must never be surfaced to callers.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let compute_id = labels.get(COMPUTE_ID_LABEL).filter(|v| !v.is_empty())?.clone();
        let preset_id = labels.get(PRESET_ID_LABEL).filter(|v| !v.is_empty())?.clone();
        let pod_name = pod.metadata.name.clone()?;

        let status = pod
            .status
            .as_ref()
            .map(|s| ComputeStatus {
                phase: s.phase.as_deref().map(ComputePhase::parse).unwrap_or_default(),
                ready: s
                    .conditions
                    .iter()
                    .flatten()
                    .any(|c| c.type_ == "Ready" && c.status == "True"),
                message: s.message.clone(),
                conditions: s
                    .conditions
                    .iter()
                    .flatten()
                    .map(|c| ComputeCondition {
                        type_: c.type_.clone(),
                        status: c.status.clone(),
                        reason: c.reason.clone(),
                        message: c.message.clone(),
                        last_transition: c.last_transition_time.as_ref().map(|t| t.0),
                    })
                    .collect(),
            })
            .unwrap_or_default();

        let spec = pod.spec.as_ref();
        let first_container = spec.and_then(|s| s.containers.first());
        let resources = first_container
            .and_then(|c| c.resources.as_ref())
            .map(Resources::from_k8s)
            .unwrap_or_default();

        let mut ports = BTreeMap::new();
        for container in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
            for port in container.ports.iter().flatten() {
                if let Some(name) = &port.name {
                    ports.insert(name.clone(), port.container_port);
                }
            }
        }

        Some(Self {
            compute_id,
            deployment_name: preset_deployment_name(&preset_id),
            preset_id,
            pod_name,
            status,
            resources,
            pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
            host_ip: pod.status.as_ref().and_then(|s| s.host_ip.clone()),
            ports,
            created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            labels,
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
        })
    }
}

impl ComputeFilters {
    /// Whether a compute passes the phase and label-subset predicates. The preset filter
    /// is pushed into the label selector at query time and re-checked here for callers
    /// filtering in memory.
    pub fn matches(&self, info: &ComputeInfo) -> bool {
        if let Some(id) = &self.preset_id {
            if &info.preset_id != id {
                return false;
            }
        }
        if let Some(phase) = self.phase {
            if info.status.phase != phase {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| info.labels.get(k) == Some(v))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with_labels(labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("preset-py-00001".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "sandbox".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.244.0.7".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_from_pod_projects_identity_and_status() {
        let pod = pod_with_labels(&[
            ("app", "compute"),
            ("presetId", "py"),
            ("computeId", "c1"),
        ]);
        let info = ComputeInfo::from_pod(&pod).unwrap();
        assert_eq!(info.compute_id, "c1");
        assert_eq!(info.preset_id, "py");
        assert_eq!(info.deployment_name, "preset-py");
        assert_eq!(info.status.phase, ComputePhase::Running);
        assert!(info.status.ready);
        assert_eq!(info.pod_ip.as_deref(), Some("10.244.0.7"));
        assert_eq!(info.ports.get("http"), Some(&8080));
    }

    #[test]
    fn test_from_pod_rejects_pods_missing_identity_labels() {
        assert!(ComputeInfo::from_pod(&pod_with_labels(&[("app", "compute")])).is_none());
        assert!(
            ComputeInfo::from_pod(&pod_with_labels(&[("app", "compute"), ("presetId", "py")]))
                .is_none()
        );
        assert!(
            ComputeInfo::from_pod(&pod_with_labels(&[("app", "compute"), ("computeId", "c1")]))
                .is_none()
        );
        // An empty label value is as good as a missing one.
        assert!(ComputeInfo::from_pod(&pod_with_labels(&[
            ("app", "compute"),
            ("presetId", "py"),
            ("computeId", ""),
        ]))
        .is_none());
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!(ComputePhase::parse("Running"), ComputePhase::Running);
        assert_eq!(ComputePhase::parse("Pending"), ComputePhase::Pending);
        assert_eq!(ComputePhase::parse("Succeeded"), ComputePhase::Succeeded);
        assert_eq!(ComputePhase::parse("Failed"), ComputePhase::Failed);
        assert_eq!(ComputePhase::parse("Evicted"), ComputePhase::Unknown);
    }

    #[test]
    fn test_filters_phase_and_labels() {
        let pod = pod_with_labels(&[
            ("app", "compute"),
            ("presetId", "py"),
            ("computeId", "c1"),
        ]);
        let info = ComputeInfo::from_pod(&pod).unwrap();

        assert!(ComputeFilters::default().matches(&info));
        assert!(ComputeFilters {
            preset_id: Some("py".into()),
            phase: Some(ComputePhase::Running),
            ..Default::default()
        }
        .matches(&info));
        assert!(!ComputeFilters {
            phase: Some(ComputePhase::Failed),
            ..Default::default()
        }
        .matches(&info));
    }
}
