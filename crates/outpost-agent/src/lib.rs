//! outpost-agent: reverse tunnel control agent
//!
//! The agent keeps outbound connections to tunnel servers in line with a
//! declared configuration tree. Change notifications are reconciled into the
//! tree, the connection manager starts and stops one connection per
//! (tunnel, destination), targets are registered on every live connection
//! and inbound streams are bridged to local services. Operational state is
//! mirrored to a state publisher.

pub mod reconciler;
pub mod schema;
pub mod source;
pub mod state;
pub mod targets;
pub mod telemetry;
pub mod tree;
pub mod tunnel;

pub use reconciler::Reconciler;
pub use state::AgentState;
