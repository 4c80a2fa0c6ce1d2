//! Structural config paths

/// Commit marker closing a transaction
pub const COMMIT_END_PATH: &str = ".commit.end";

pub const ROOT_PATH: &str = ".system.grpc_tunnel";
pub const DESTINATION_PATH: &str = ".system.grpc_tunnel.destination";
pub const TUNNEL_PATH: &str = ".system.grpc_tunnel.tunnel";
pub const TUNNEL_DESTINATION_PATH: &str = ".system.grpc_tunnel.tunnel.destination";
pub const TUNNEL_TARGET_PATH: &str = ".system.grpc_tunnel.tunnel.target";
