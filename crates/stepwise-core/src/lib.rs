//! Workflow execution engine and repository trait definitions for stepwise.
//!
//! This crate defines the engine (graph, conditions, bindings, actors, state
//! machine, run coordinator) and the "ports" (repository traits) that the
//! infrastructure layer implements. It depends only on `stepwise-types` --
//! never on `stepwise-infra` or any database/IO crate.

pub mod repository;
pub mod workflow;
