//! Core error types for outpost

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while establishing a connection to a tunnel server
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The dial itself failed
    #[error("failed dial addr={address}: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The attempt did not finish within the per-attempt timeout
    #[error("failed dial addr={0}: timed out")]
    DialTimeout(String),

    /// The network instance has no matching namespace
    #[error("network namespace {name:?} not found: {source}")]
    NamespaceNotFound {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// A tunnel referenced no configured destination
    #[error("no destinations found")]
    NoDestinations,
}

/// Errors raised while resolving a target's identity, type or dial address
#[derive(Error, Debug)]
pub enum TargetError {
    /// Custom template failed to parse or render
    #[error("failed to render template {selector}: {message}")]
    Template { selector: String, message: String },

    /// A custom-typed target has no local address to dial
    #[error("local_address is required for custom target types")]
    MissingLocalAddress,

    /// No identity selector was set
    #[error("target has no identity selector")]
    NoIdentity,

    /// No type selector was set
    #[error("target has no type selector")]
    NoType,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
