//! Preset types: the declarative container templates computes are provisioned from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Container image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Pull the image on every pod start.
    Always,

    /// Pull only when the image is absent on the node.
    #[default]
    IfNotPresent,

    /// Never pull; the image must already be present.
    Never,
}

/// A single environment variable passed to the sandbox container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    /// Variable name.
    pub name: String,

    /// Variable value.
    pub value: String,
}

/// A named port the sandbox container declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port name, used as the key in the compute's port map.
    pub name: String,

    /// Container port number.
    pub port: i32,
}

/// A scratch-space mount inside the sandbox container. Mounts materialize as named
/// emptyDir volumes; external volume sources are out of scope at this layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountSpec {
    /// Volume name.
    pub name: String,

    /// Mount path inside the container.
    pub mount_path: String,

    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Resource requests and limits, keyed by resource name (`cpu`, `memory`, ...) with
/// cluster quantity strings as values (`500m`, `1Gi`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Requested amounts.
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    /// Upper limits.
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// A named, versioned container template. Creating a preset materializes it as exactly
/// one zero-replica Deployment; computes are provisioned from it by scaling that
/// Deployment up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetSpec {
    /// Unique preset identifier. Must be label-safe; the backing deployment name is
    /// derived from it.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Template version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Container image reference.
    pub image: String,

    /// Image pull policy.
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Entrypoint command. Empty means the image default.
    #[serde(default)]
    pub command: Vec<String>,

    /// Entrypoint arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,

    /// Declared ports.
    #[serde(default)]
    pub ports: Vec<PortSpec>,

    /// Scratch-space mounts.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountSpec>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Resource requests and limits.
    pub resources: Option<Resources>,

    /// Free-form labels merged onto the deployment and pod template.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations merged onto the deployment.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The materialized state of a preset, projected back from its Deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetInfo {
    /// Preset identifier.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Template version.
    pub version: String,

    /// The backing deployment's name, a pure function of the preset identifier.
    pub deployment_name: String,

    /// Container image reference.
    pub image: String,

    /// Current base replica count: the number of live computes the deployment is
    /// holding. Informational; mutated only by compute create/delete.
    pub replicas: i32,

    /// When the deployment was created.
    pub created_at: Option<DateTime<Utc>>,

    /// When the template was last updated.
    pub updated_at: Option<DateTime<Utc>>,

    /// Full label set on the deployment.
    pub labels: BTreeMap<String, String>,

    /// Full annotation set on the deployment.
    pub annotations: BTreeMap<String, String>,
}

/// Query predicates for listing presets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetFilters {
    /// Restrict to a single preset identifier.
    pub preset_id: Option<String>,

    /// Labels every returned preset must carry (subset match).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Read-only projection of a preset deployment's provisioning health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    /// Replicas the deployment wants.
    pub desired: i32,

    /// Replicas currently ready.
    pub ready: i32,

    /// Replicas currently available.
    pub available: i32,

    /// Replicas running the latest template.
    pub updated: i32,

    /// Deployment conditions.
    pub conditions: Vec<DeploymentConditionInfo>,
}

/// A single deployment condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConditionInfo {
    /// Condition type (`Available`, `Progressing`, ...).
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status string (`True`, `False`, `Unknown`).
    pub status: String,

    /// Machine-readable reason, when reported.
    pub reason: Option<String>,

    /// Human-readable message, when reported.
    pub message: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullPolicy {
    /// The cluster API string for this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

impl Resources {
    /// Whether neither requests nor limits are set.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    /// Converts to the cluster API representation.
    pub fn to_k8s(&self) -> ResourceRequirements {
        let quantify = |m: &BTreeMap<String, String>| -> Option<BTreeMap<String, Quantity>> {
            if m.is_empty() {
                None
            } else {
                Some(
                    m.iter()
                        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                        .collect(),
                )
            }
        };
        ResourceRequirements {
            requests: quantify(&self.requests),
            limits: quantify(&self.limits),
            ..Default::default()
        }
    }

    /// Projects the cluster API representation back into quantity strings.
    pub fn from_k8s(reqs: &ResourceRequirements) -> Self {
        let stringify = |m: &Option<BTreeMap<String, Quantity>>| -> BTreeMap<String, String> {
            m.as_ref()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
                .unwrap_or_default()
        };
        Self {
            requests: stringify(&reqs.requests),
            limits: stringify(&reqs.limits),
        }
    }
}

impl PresetFilters {
    /// Whether a preset passes the label-subset filter.
    pub fn matches(&self, info: &PresetInfo) -> bool {
        if let Some(id) = &self.preset_id {
            if &info.id != id {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| info.labels.get(k) == Some(v))
    }
}

fn default_version() -> String {
    "v1".to_string()
}

impl PresetSpec {
    /// A spec with the mandatory fields set and everything else defaulted.
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            image: image.into(),
            ..Default::default()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
