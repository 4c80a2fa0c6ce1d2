//! outpost-core: Core abstractions and configuration for outpost
//!
//! This crate provides the state vocabulary, error taxonomy, agent
//! configuration and system identity record shared by the agent crates.

pub mod config;
pub mod error;
pub mod identity;
pub mod types;

pub use error::{ConfigError, ConnectionError, TargetError};
pub use identity::SystemInfo;
pub use types::{AdminState, OperState};
