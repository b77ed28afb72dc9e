//! Error types for the podbox orchestrator.

use std::time::Duration;

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type alias using [`PodboxError`].
pub type PodboxResult<T> = Result<T, PodboxError>;

/// The cluster resource kinds the orchestrator operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A pod, the concrete manifestation of one compute instance.
    Pod,

    /// A deployment, the provisioning primitive backing one preset.
    Deployment,
}

/// Errors produced by the podbox orchestrator.
///
/// `NotFound` is a recoverable condition expected in polling and lookup flows; everything
/// else is either a caller mistake (`Validation`, `EmptySelector`), a state conflict
/// (`InUse`, `Conflict`, `AlreadyExists`), a bound being hit (`Timeout`, `Canceled`), or a
/// transport failure (`Cluster`). The `Compute` and `Preset` variants wrap an underlying
/// error with the identifier and operation that triggered it so callers can log actionable
/// context without parsing strings.
#[derive(Error, pretty_error_debug::Debug)]
pub enum PodboxError {
    /// A pod or deployment is absent from the cluster.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// The resource kind that was looked up.
        kind: ResourceKind,
        /// The namespace that was searched.
        namespace: String,
        /// The resource name or selector that matched nothing.
        name: String,
    },

    /// A spec failed validation before any cluster call was made.
    #[error("invalid {field} {value:?}: {message}")]
    Validation {
        /// The offending field.
        field: &'static str,
        /// The offending value.
        value: String,
        /// What was expected.
        message: String,
    },

    /// A preset cannot be deleted while computes are running against it.
    #[error("preset {preset_id} is in use ({replicas} running compute(s))")]
    InUse {
        /// The preset that was asked to be deleted.
        preset_id: String,
        /// Its current replica count.
        replicas: i32,
    },

    /// A poll loop or bounded call exceeded its time budget.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The operation that ran out of time.
        operation: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The caller's operation context was cancelled.
    #[error("{operation} was canceled")]
    Canceled {
        /// The operation that observed the cancellation.
        operation: String,
    },

    /// A conditional update lost against a concurrent writer.
    #[error("conflicting update to {kind} {namespace}/{name}")]
    Conflict {
        /// The resource kind being updated.
        kind: ResourceKind,
        /// The namespace of the resource.
        namespace: String,
        /// The name of the resource.
        name: String,
    },

    /// A resource with the same name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// The resource kind being created.
        kind: ResourceKind,
        /// The namespace of the resource.
        namespace: String,
        /// The name of the resource.
        name: String,
    },

    /// An empty label selector was passed to a bulk-delete path. Rejected as a programming
    /// error: an unconstrained delete-collection would wipe the namespace.
    #[error("empty label selector passed to {operation}")]
    EmptySelector {
        /// The bulk operation that rejected the selector.
        operation: &'static str,
    },

    /// The cluster client itself could not be initialized.
    #[error("failed to initialize cluster client")]
    ClientInit {
        /// The underlying configuration/transport error.
        #[source]
        source: kube::Error,
    },

    /// Any other cluster API failure, wrapped with enough context for diagnosis.
    #[error("cluster call {operation} on {kind} {namespace}/{name} failed")]
    Cluster {
        /// The client operation that failed.
        operation: &'static str,
        /// The resource kind involved.
        kind: ResourceKind,
        /// The namespace of the resource.
        namespace: String,
        /// The name or selector involved.
        name: String,
        /// The underlying transport/API error.
        #[source]
        source: kube::Error,
    },

    /// An error attributed to a specific compute instance.
    #[error("compute {compute_id}: {operation} failed")]
    Compute {
        /// The compute the operation was acting on.
        compute_id: String,
        /// The manager operation that failed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: Box<PodboxError>,
    },

    /// An error attributed to a specific preset.
    #[error("preset {preset_id}: {operation} failed")]
    Preset {
        /// The preset the operation was acting on.
        preset_id: String,
        /// The registry operation that failed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: Box<PodboxError>,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PodboxError {
    /// Builds a validation error.
    pub fn validation(
        field: &'static str,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field,
            value: value.into(),
            message: message.into(),
        }
    }

    /// Wraps an error with compute context.
    pub fn compute(compute_id: impl Into<String>, operation: &'static str, source: Self) -> Self {
        Self::Compute {
            compute_id: compute_id.into(),
            operation,
            source: Box::new(source),
        }
    }

    /// Wraps an error with preset context.
    pub fn preset(preset_id: impl Into<String>, operation: &'static str, source: Self) -> Self {
        Self::Preset {
            preset_id: preset_id.into(),
            operation,
            source: Box::new(source),
        }
    }

    /// Whether this error is, or wraps, a not-found condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, a conditional-update conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, a validation failure.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, an in-use refusal.
    pub fn is_in_use(&self) -> bool {
        match self {
            Self::InUse { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_in_use(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, a cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled { .. } => true,
            Self::Compute { source, .. } | Self::Preset { source, .. } => source.is_canceled(),
            _ => false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Deployment => write!(f, "deployment"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_see_through_wrappers() {
        let inner = PodboxError::NotFound {
            kind: ResourceKind::Pod,
            namespace: "default".into(),
            name: "c1".into(),
        };
        let wrapped = PodboxError::compute("c1", "get_compute", inner);
        assert!(wrapped.is_not_found());
        assert!(!wrapped.is_timeout());

        let doubly = PodboxError::preset(
            "py",
            "delete_preset",
            PodboxError::InUse {
                preset_id: "py".into(),
                replicas: 2,
            },
        );
        assert!(doubly.is_in_use());
    }

    #[test]
    fn test_display_carries_context() {
        let err = PodboxError::Timeout {
            operation: "claim pod for compute c1".into(),
            timeout: Duration::from_secs(60),
        };
        let msg = err.to_string();
        assert!(msg.contains("claim pod for compute c1"));
        assert!(msg.contains("timed out"));
    }
}
