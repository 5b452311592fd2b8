//! Core type definitions shared across the engine.
//!
//! Identifiers are plain integer aliases, matching how the rest of Strata
//! names cluster members and Raft positions:
//!
//! - [`NodeId`] = `u64`: cluster member identifier
//! - [`Term`] = `u64`: Raft election epoch
//! - [`LogIndex`] = `u64`: 1-based log position, `0` meaning "no entry"

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;
