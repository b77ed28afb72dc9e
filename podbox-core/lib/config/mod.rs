//! Configuration for the podbox orchestrator.
//!
//! The configuration surface is deliberately small: a target namespace, a default per-call
//! deadline, and the poll/refresh cadences. No environment variables, files, or CLI flags
//! are read at this layer; those belong to the surrounding packages.

use std::time::Duration;

use getset::Getters;
use podbox_utils::{
    DEFAULT_CACHE_REFRESH_INTERVAL, DEFAULT_CALL_TIMEOUT, DEFAULT_CONFLICT_RETRIES,
    DEFAULT_CREATE_POLL_INTERVAL, DEFAULT_CREATE_TIMEOUT, DEFAULT_NAMESPACE,
};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings shared by the preset registry and the compute lifecycle manager.
///
/// ## Example
///
/// ```
/// use podbox_core::config::OrchestratorConfig;
/// use std::time::Duration;
///
/// let config = OrchestratorConfig::builder()
///     .namespace("sandboxes")
///     .call_timeout(Duration::from_secs(10))
///     .build();
///
/// assert_eq!(config.get_namespace(), "sandboxes");
/// ```
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct OrchestratorConfig {
    /// Namespace all pods and deployments live in.
    #[builder(default = DEFAULT_NAMESPACE.to_string(), setter(into))]
    namespace: String,

    /// Deadline applied to a cluster call whose context carries none.
    #[builder(default = DEFAULT_CALL_TIMEOUT)]
    call_timeout: Duration,

    /// Interval between candidate-pod polls during compute creation.
    #[builder(default = DEFAULT_CREATE_POLL_INTERVAL)]
    create_poll_interval: Duration,

    /// Total budget for finding and claiming a pod during compute creation.
    #[builder(default = DEFAULT_CREATE_TIMEOUT)]
    create_timeout: Duration,

    /// Interval between unconditional background cache refreshes.
    #[builder(default = DEFAULT_CACHE_REFRESH_INTERVAL)]
    cache_refresh_interval: Duration,

    /// Attempts allowed for a conditional update before giving up on conflicts.
    #[builder(default = DEFAULT_CONFLICT_RETRIES)]
    conflict_retries: u32,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
