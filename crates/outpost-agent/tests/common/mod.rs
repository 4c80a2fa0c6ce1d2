//! In-process fakes for agent integration tests
//!
//! `FakeDialer` hands out in-memory transports and can be told to fail
//! dials to an address. `FakeServer` plays every tunnel server at once: the
//! dialer writes the dialed address as the first line of each transport,
//! and the fake client reads it during `register` so events are recorded
//! per server address.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use outpost_agent::reconciler::paths::{
    DESTINATION_PATH, ROOT_PATH, TUNNEL_DESTINATION_PATH, TUNNEL_PATH, TUNNEL_TARGET_PATH,
};
use outpost_agent::reconciler::{ChangeNotification, Reconciler};
use outpost_agent::targets::TargetResolver;
use outpost_agent::telemetry::MemoryPublisher;
use outpost_agent::tree::DesiredState;
use outpost_agent::tunnel::{
    ConnectionKey, ConnectionManager, Dialer, Namespace, RetryPolicy, SharedState,
};
use outpost_core::config::AgentConfig;
use outpost_core::error::ConnectionError;
use outpost_core::{OperState, SystemInfo};
use outpost_protocol::{
    ClientFactory, DynStream, InboundHandler, ProtocolError, Target, TunnelClient,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const HOSTNAME: &str = "leaf1";
pub const MAC_ADDRESS: &str = "1A:2B:3C:4D:5E:6F";

// --- dialer ---

#[derive(Default)]
pub struct FakeDialer {
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<String, usize>>,
    remotes: Mutex<Vec<DuplexStream>>,
}

impl FakeDialer {
    /// Fail the next `count` dials to `address`
    pub fn fail_next(&self, address: &str, count: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(address.to_string(), count);
    }

    pub fn attempts(&self, address: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    fn resolve(&self, _network_instance: &str) -> Result<Namespace, ConnectionError> {
        Ok(Namespace::host())
    }

    async fn dial(&self, _namespace: &Namespace, address: &str) -> Result<DynStream, ConnectionError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default() += 1;

        let refuse = match self.failures.lock().unwrap().get_mut(address) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if refuse {
            return Err(ConnectionError::DialFailed {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        let (local, mut remote) = tokio::io::duplex(4096);
        remote
            .write_all(format!("{}\n", address).as_bytes())
            .await
            .map_err(|source| ConnectionError::DialFailed {
                address: address.to_string(),
                source,
            })?;
        self.remotes.lock().unwrap().push(remote);
        Ok(Box::new(local))
    }
}

// --- tunnel server and client ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Registered(String),
    NewTarget(String, Target),
    DeleteTarget(String, Target),
    Closed(String),
}

struct Session {
    handler: Arc<dyn InboundHandler>,
    fail: CancellationToken,
    hangup: CancellationToken,
}

#[derive(Default)]
pub struct FakeServer {
    events: Mutex<Vec<Event>>,
    sessions: Mutex<HashMap<String, Session>>,
    reject_registration: AtomicBool,
}

impl FakeServer {
    pub fn reject_registrations(&self) {
        self.reject_registration.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn registrations(&self, address: &str) -> usize {
        self.count(|e| matches!(e, Event::Registered(a) if a == address))
    }

    pub fn closes(&self, address: &str) -> usize {
        self.count(|e| matches!(e, Event::Closed(a) if a == address))
    }

    pub fn deleted(&self, address: &str) -> BTreeSet<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::DeleteTarget(a, target) if a == address => Some(target.key()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Targets announced on the current connection to `address`
    pub fn registered_targets(&self, address: &str) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        for event in self.events() {
            match event {
                Event::Registered(a) | Event::Closed(a) if a == address => targets.clear(),
                Event::NewTarget(a, target) if a == address => {
                    targets.insert(target.key());
                }
                Event::DeleteTarget(a, target) if a == address => {
                    targets.remove(&target.key());
                }
                _ => {}
            }
        }
        targets
    }

    /// Break the serve loop of the connection to `address`
    pub fn fail(&self, address: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get(address) {
            session.fail.cancel();
        }
    }

    /// End the serve loop of the connection to `address` without an error
    pub fn hang_up(&self, address: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get(address) {
            session.hangup.cancel();
        }
    }

    /// Open an inbound stream towards `target` over the connection to
    /// `address`, returning the server end.
    pub fn open_stream(&self, address: &str, target: Target) -> DuplexStream {
        let handler = self
            .sessions
            .lock()
            .unwrap()
            .get(address)
            .map(|session| Arc::clone(&session.handler))
            .expect("no session for address");
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = handler.handle(target, Box::new(local)).await;
        });
        remote
    }
}

pub struct FakeFactory {
    pub server: Arc<FakeServer>,
}

impl ClientFactory for FakeFactory {
    fn new_client(
        &self,
        transport: DynStream,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn TunnelClient>, ProtocolError> {
        Ok(Arc::new(FakeClient {
            server: Arc::clone(&self.server),
            transport: tokio::sync::Mutex::new(Some(BufReader::new(transport))),
            handler,
            address: Mutex::new(String::new()),
            closed: CancellationToken::new(),
            fail: CancellationToken::new(),
            hangup: CancellationToken::new(),
        }))
    }
}

struct FakeClient {
    server: Arc<FakeServer>,
    transport: tokio::sync::Mutex<Option<BufReader<DynStream>>>,
    handler: Arc<dyn InboundHandler>,
    address: Mutex<String>,
    closed: CancellationToken,
    fail: CancellationToken,
    hangup: CancellationToken,
}

impl FakeClient {
    fn address(&self) -> String {
        self.address.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelClient for FakeClient {
    async fn register(&self, _cancel: &CancellationToken) -> Result<(), ProtocolError> {
        let mut line = String::new();
        {
            let mut transport = self.transport.lock().await;
            let reader = transport.as_mut().ok_or(ProtocolError::AlreadyRegistered)?;
            reader.read_line(&mut line).await?;
        }
        let address = line.trim().to_string();
        *self.address.lock().unwrap() = address.clone();

        if self.server.reject_registration.load(Ordering::SeqCst) {
            return Err(ProtocolError::RegistrationRejected(
                "agent not allowed".to_string(),
            ));
        }

        self.server.sessions.lock().unwrap().insert(
            address.clone(),
            Session {
                handler: Arc::clone(&self.handler),
                fail: self.fail.clone(),
                hangup: self.hangup.clone(),
            },
        );
        self.server.record(Event::Registered(address));
        Ok(())
    }

    async fn new_target(&self, target: &Target) -> Result<(), ProtocolError> {
        self.server
            .record(Event::NewTarget(self.address(), target.clone()));
        Ok(())
    }

    async fn delete_target(&self, target: &Target) -> Result<(), ProtocolError> {
        self.server
            .record(Event::DeleteTarget(self.address(), target.clone()));
        Ok(())
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ProtocolError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.closed.cancelled() => Ok(()),
            _ = self.hangup.cancelled() => Ok(()),
            _ = self.fail.cancelled() => Err(ProtocolError::ConnectionLost("server went away".to_string())),
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.server.record(Event::Closed(self.address()));
        }
    }
}

// --- harness ---

pub struct Harness {
    pub reconciler: Reconciler,
    pub publisher: Arc<MemoryPublisher>,
    pub dialer: Arc<FakeDialer>,
    pub server: Arc<FakeServer>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let config = AgentConfig {
            agent_name: "test-agent".to_string(),
            ..AgentConfig::default()
        };
        let system = SystemInfo {
            name: HOSTNAME.to_string(),
            version: "v24.3.1".to_string(),
            chassis_mac_address: MAC_ADDRESS.to_string(),
            ..SystemInfo::default()
        };

        let publisher = Arc::new(MemoryPublisher::new());
        let dialer = Arc::new(FakeDialer::default());
        let server = Arc::new(FakeServer::default());
        let shutdown = CancellationToken::new();

        let manager = ConnectionManager::new(
            &config,
            Arc::new(tokio::sync::Mutex::new(DesiredState::new())),
            TargetResolver::new(system, &config),
            publisher.clone(),
            dialer.clone(),
            Arc::new(FakeFactory {
                server: Arc::clone(&server),
            }),
            shutdown.clone(),
        )
        .with_retry(RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_millis(20),
        ));

        Self {
            reconciler: Reconciler::new(manager),
            publisher,
            dialer,
            server,
            shutdown,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        self.reconciler.manager()
    }

    pub fn tree(&self) -> &SharedState {
        self.manager().tree()
    }

    /// Deliver `notifications` followed by the commit marker
    pub async fn commit(&mut self, notifications: Vec<ChangeNotification>) {
        for notification in notifications {
            self.reconciler.handle(notification).await;
        }
        self.reconciler.handle(ChangeNotification::commit()).await;
    }

    pub async fn is_connected(&self, tunnel: &str, destination: &str) -> bool {
        self.manager()
            .registry()
            .contains(&ConnectionKey::new(tunnel, destination))
            .await
    }

    pub async fn association_state(&self, tunnel: &str, destination: &str) -> Option<(OperState, String)> {
        let state = self.tree().lock().await;
        state
            .tunnels
            .get(tunnel)
            .and_then(|t| t.destinations.get(destination))
            .map(|assoc| (assoc.oper_state, assoc.down_reason.clone()))
    }

    /// Poll the tree until `check` holds
    pub async fn wait_for_state<F>(&self, what: &str, check: F)
    where
        F: Fn(&DesiredState) -> bool,
    {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            {
                let state = self.tree().lock().await;
                if check(&*state) {
                    return;
                }
                if Instant::now() > deadline {
                    panic!("timed out waiting for {}: {:#?}", what, *state);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_association(&self, tunnel: &str, destination: &str, expected: OperState) {
        self.wait_for_state(&format!("{}/{} {}", tunnel, destination, expected), |state| {
            state
                .tunnels
                .get(tunnel)
                .and_then(|t| t.destinations.get(destination))
                .map(|assoc| assoc.oper_state == expected)
                .unwrap_or(false)
        })
        .await;
    }

    /// Wait until every target state of `(tunnel, destination)` is up and
    /// there are `count` of them
    pub async fn wait_for_targets_up(&self, tunnel: &str, destination: &str, count: usize) {
        self.wait_for_state(&format!("{} targets up on {}/{}", count, tunnel, destination), |state| {
            state
                .tunnels
                .get(tunnel)
                .and_then(|t| t.destinations.get(destination))
                .map(|assoc| {
                    assoc.targets.len() == count
                        && assoc.targets.values().all(|t| t.oper_state == OperState::Up)
                })
                .unwrap_or(false)
        })
        .await;
    }
}

/// Poll until `check` holds
pub async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// --- notifications ---

pub fn root(admin_state: &str) -> ChangeNotification {
    ChangeNotification::create(ROOT_PATH, &[], json!({ "admin_state": admin_state }))
}

pub fn root_update(admin_state: &str) -> ChangeNotification {
    ChangeNotification::update(ROOT_PATH, &[], json!({ "admin_state": admin_state }))
}

pub fn destination_payload(address: &str) -> Value {
    json!({"destination": {
        "address": {"value": address},
        "port": {"value": "9100"},
        "no_tls": {"value": true}
    }})
}

pub fn destination(name: &str, address: &str) -> ChangeNotification {
    ChangeNotification::create(DESTINATION_PATH, &[name], destination_payload(address))
}

pub fn tunnel(name: &str, admin_state: &str) -> ChangeNotification {
    ChangeNotification::create(TUNNEL_PATH, &[name], json!({"tunnel": {"admin_state": admin_state}}))
}

pub fn tunnel_update(name: &str, admin_state: &str) -> ChangeNotification {
    ChangeNotification::update(TUNNEL_PATH, &[name], json!({"tunnel": {"admin_state": admin_state}}))
}

pub fn tunnel_delete(name: &str) -> ChangeNotification {
    ChangeNotification::delete(TUNNEL_PATH, &[name])
}

pub fn association(tunnel: &str, destination: &str) -> ChangeNotification {
    ChangeNotification::create(TUNNEL_DESTINATION_PATH, &[tunnel, destination], json!({}))
}

pub fn association_delete(tunnel: &str, destination: &str) -> ChangeNotification {
    ChangeNotification::delete(TUNNEL_DESTINATION_PATH, &[tunnel, destination])
}

/// Target with `id` one of `node_name`, `user_agent`, `mac_address` and
/// `kind` one of `grpc_server`, `ssh_server`
pub fn target(tunnel: &str, name: &str, id: &str, kind: &str) -> ChangeNotification {
    ChangeNotification::create(
        TUNNEL_TARGET_PATH,
        &[tunnel, name],
        json!({"target": {"id": {id: {"value": true}}, "type": {kind: {"value": true}}}}),
    )
}

pub fn target_update(tunnel: &str, name: &str, id: &str, kind: &str) -> ChangeNotification {
    ChangeNotification::update(
        TUNNEL_TARGET_PATH,
        &[tunnel, name],
        json!({"target": {"id": {id: {"value": true}}, "type": {kind: {"value": true}}}}),
    )
}

pub fn target_with_address(tunnel: &str, name: &str, kind: &str, local_address: &str) -> ChangeNotification {
    ChangeNotification::create(
        TUNNEL_TARGET_PATH,
        &[tunnel, name],
        json!({"target": {
            "id": {"node_name": {"value": true}},
            "type": {kind: {"value": true}},
            "local_address": {"value": local_address}
        }}),
    )
}

pub fn target_delete(tunnel: &str, name: &str) -> ChangeNotification {
    ChangeNotification::delete(TUNNEL_TARGET_PATH, &[tunnel, name])
}

pub const ENABLE: &str = "ADMIN_STATE_enable";
pub const DISABLE: &str = "ADMIN_STATE_disable";
