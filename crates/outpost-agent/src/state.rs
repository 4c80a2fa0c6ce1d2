//! Agent runtime wiring

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use outpost_core::config::AgentConfig;
use outpost_core::SystemInfo;
use outpost_protocol::{ClientFactory, FramedClientFactory};

use crate::reconciler::Reconciler;
use crate::targets::TargetResolver;
use crate::telemetry::{LogPublisher, StatePublisher};
use crate::tree::DesiredState;
use crate::tunnel::{dialer_for, ConnectionManager, Dialer};

/// Everything the agent daemon runs on
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Connection manager; owns the tree and the registry
    pub manager: ConnectionManager,
    /// Process-wide shutdown token
    pub shutdown: CancellationToken,
}

impl AgentState {
    /// Wire the agent with explicit collaborators.
    pub fn new(
        config: AgentConfig,
        system: SystemInfo,
        publisher: Arc<dyn StatePublisher>,
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let resolver = TargetResolver::new(system, &config);
        let manager = ConnectionManager::new(
            &config,
            Arc::new(Mutex::new(DesiredState::new())),
            resolver,
            publisher,
            dialer,
            factory,
            shutdown.clone(),
        );
        Self {
            config,
            manager,
            shutdown,
        }
    }

    /// Production wiring: state to the log, namespace-aware dialing and the
    /// framed tunnel client.
    pub fn from_config(config: AgentConfig, system: SystemInfo) -> Self {
        let dialer = dialer_for(&config);
        let factory = Arc::new(FramedClientFactory::new(config.agent_name.clone()));
        Self::new(config, system, Arc::new(LogPublisher), dialer, factory)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.manager.clone())
    }

    /// Stop every connection; the manager cancels the process-wide token.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
