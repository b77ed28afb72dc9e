//! The label contract shared by every podbox component.
//!
//! Labels are the orchestrator's only indexing mechanism. There is no side database, so
//! the keys below are the de facto persisted schema. Changing any of them is a breaking
//! change to discovery of already-provisioned resources.

use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Label key distinguishing podbox-managed resources by role.
pub const APP_LABEL: &str = "app";

/// `app` label value carried by every compute pod.
pub const APP_COMPUTE: &str = "compute";

/// `app` label value carried by every preset deployment.
pub const APP_PRESET: &str = "preset";

/// Label key holding the owning preset identifier, present on both preset deployments and
/// compute pods.
pub const PRESET_ID_LABEL: &str = "presetId";

/// Label key holding the unique compute identifier. Written onto a pod when it is claimed;
/// a pod without it is not a valid compute.
pub const COMPUTE_ID_LABEL: &str = "computeId";

/// Label key holding the preset's human-readable name on its deployment.
pub const NAME_LABEL: &str = "name";

/// Label key holding the preset's version on its deployment.
pub const VERSION_LABEL: &str = "version";

/// Fixed prefix for deployment names derived from preset identifiers.
pub const PRESET_DEPLOYMENT_PREFIX: &str = "preset-";

/// Annotation stamped on a preset deployment whenever its template is updated. The cluster
/// records creation time only, so update time rides on this annotation.
pub const UPDATED_AT_ANNOTATION: &str = "podbox.dev/updated-at";

/// Maximum length of a label value (and of the identifiers we store in labels).
pub const MAX_LABEL_VALUE_LEN: usize = 63;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives the backing deployment name for a preset identifier.
///
/// The mapping is a pure function so lookup never needs a side index.
pub fn preset_deployment_name(preset_id: &str) -> String {
    format!("{}{}", PRESET_DEPLOYMENT_PREFIX, preset_id)
}

/// Generates a fresh compute identifier, used when the caller does not supply one.
pub fn generate_compute_id() -> String {
    format!("compute-{}", Uuid::new_v4().simple())
}

/// Renders key/value pairs into a label selector string (`k1=v1,k2=v2`).
pub fn render_selector<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Checks whether a string is usable as a label value: at most 63 characters, starting and
/// ending with an alphanumeric, with only alphanumerics, `-`, `_`, and `.` in between.
///
/// Identifiers that end up in labels (preset ids, compute ids) must pass this check before
/// any cluster call is made with them.
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_LABEL_VALUE_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
