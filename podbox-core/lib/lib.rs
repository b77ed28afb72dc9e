//! `podbox-core` is a cluster-native orchestrator for ephemeral code-execution sandboxes.
//!
//! # Overview
//!
//! podbox turns a declarative "preset" (a container template backed by a zero-replica
//! Deployment) into a pool of addressable, individually identifiable running sandbox
//! instances ("computes") purely through replica-count changes and label bookkeeping. It
//! has no scheduler and no database of its own: the cluster's resource store is the only
//! persisted state, and labels are the only index.
//!
//! # Architecture
//!
//! - **Cluster access** ([`cluster`]): a small capability trait over Pod and Deployment
//!   operations, backed by a kube client in production and an in-memory reconciling fake
//!   in tests. Every call is bounded by a deadline and observes caller cancellation.
//! - **Preset registry** ([`management::PresetManager`]): template lifecycle. Each preset
//!   is exactly one Deployment whose name is derived from the preset identifier.
//! - **Compute lifecycle** ([`management::ComputeManager`]): creates an instance by
//!   scaling its preset's Deployment up by one and claiming the fresh pod with a unique
//!   identifier label; lists, fetches, restarts, and deletes instances by label; keeps a
//!   periodically refreshed read-through cache.
//!
//! # Modules
//!
//! - [`cluster`] - Pod and deployment access behind the [`cluster::ClusterClient`] trait
//! - [`config`] - Orchestrator configuration
//! - [`management`] - Preset registry and compute lifecycle manager
//! - [`models`] - Preset and compute data model

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cluster;
pub mod config;
pub mod management;
pub mod models;

pub use error::*;
