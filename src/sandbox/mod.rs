//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod executor;
pub mod globals;
pub mod host;
pub mod io;
pub mod limits;
pub mod marshal;
