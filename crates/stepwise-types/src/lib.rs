//! Shared domain types for the stepwise workflow engine.
//!
//! This crate contains the serializable vocabulary used across the engine:
//! step results, run contexts, snapshots, machine events, declarative
//! conditions, observer events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
