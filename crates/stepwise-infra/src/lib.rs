//! Infrastructure layer for stepwise.
//!
//! Contains implementations of the repository traits defined in `stepwise-core`
//! (SQLite snapshot storage) and the engine configuration loader.

pub mod config;
pub mod sqlite;
