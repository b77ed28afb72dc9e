//! Default namespaces, deadlines, and poll intervals shared across the workspace.

use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Namespace used when the caller configures none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Deadline applied to a single cluster API call whose context carries none.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between candidate-pod polls while creating a compute.
pub const DEFAULT_CREATE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total time budget for finding and claiming a pod during compute creation.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness polls while waiting for a pod to become ready.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between unconditional background refreshes of the compute cache.
pub const DEFAULT_CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Attempts allowed for a conditional update before giving up on a conflicted resource.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;
