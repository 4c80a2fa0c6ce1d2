//! Tunnel client capability and its framed implementation
//!
//! The agent only ever talks to a tunnel server through [`TunnelClient`]:
//! register once, announce or withdraw targets, then [`TunnelClient::start`]
//! serves inbound streams until the connection fails or is cancelled.
//!
//! [`FramedClient`] implements the capability over any byte stream using
//! [`FrameCodec`]. Each `StreamOpen` from the server is handed to the
//! [`InboundHandler`] as an in-memory duplex stream; two pump tasks move
//! bytes between that duplex and `Data` frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{Frame, FrameCodec};
use crate::error::ProtocolError;
use crate::message::{Message, PROTOCOL_VERSION};
use crate::stream::StreamId;
use crate::target::Target;

/// Outbound frames queued between callers and the writer task
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Inbound `Data` payloads queued per stream before the handler reads them
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Size of the in-memory pipe between a stream and its handler
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Largest chunk read from a handler and sent as one `Data` frame
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Byte stream usable as a tunnel transport or an inbound stream
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type DynStream = Box<dyn TunnelStream>;

/// Serves one inbound stream the tunnel server opened towards a target.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Serve `stream` for `target`. The returned error is reported to the
    /// server in the closing `StreamClose`.
    async fn handle(&self, target: Target, stream: DynStream) -> Result<(), ProtocolError>;
}

/// A live, registered connection to a tunnel server.
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Identify the agent to the server. Must succeed before anything else.
    async fn register(&self, cancel: &CancellationToken) -> Result<(), ProtocolError>;

    /// Announce a target
    async fn new_target(&self, target: &Target) -> Result<(), ProtocolError>;

    /// Withdraw a target
    async fn delete_target(&self, target: &Target) -> Result<(), ProtocolError>;

    /// Serve until the connection fails or is stopped.
    ///
    /// Returns `Ok(())` when stopped through `cancel` or [`TunnelClient::close`],
    /// and the cause otherwise.
    async fn start(&self, cancel: CancellationToken) -> Result<(), ProtocolError>;

    /// Close the underlying transport; in-flight streams unwind.
    fn close(&self);
}

/// Builds protocol clients over established transports.
pub trait ClientFactory: Send + Sync {
    fn new_client(
        &self,
        transport: DynStream,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn TunnelClient>, ProtocolError>;
}

/// Creates [`FramedClient`]s registering under a fixed agent name
#[derive(Debug, Clone)]
pub struct FramedClientFactory {
    agent: String,
}

impl FramedClientFactory {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }
}

impl ClientFactory for FramedClientFactory {
    fn new_client(
        &self,
        transport: DynStream,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn TunnelClient>, ProtocolError> {
        Ok(Arc::new(FramedClient::new(
            self.agent.clone(),
            transport,
            handler,
        )))
    }
}

/// [`TunnelClient`] speaking the framed protocol
pub struct FramedClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    agent: String,
    handler: Arc<dyn InboundHandler>,
    /// Taken by `register`
    transport: Mutex<Option<DynStream>>,
    outbound_tx: mpsc::Sender<Frame>,
    /// Taken by `register` and moved into the writer task
    outbound_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    /// Open inbound streams, keyed by server-assigned id
    streams: Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    registered: AtomicBool,
    /// Cause of the connection failure, if it failed
    failure: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl FramedClient {
    pub fn new(
        agent: impl Into<String>,
        transport: DynStream,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                agent: agent.into(),
                handler,
                transport: Mutex::new(Some(transport)),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                streams: Mutex::new(HashMap::new()),
                registered: AtomicBool::new(false),
                failure: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn ensure_registered(&self) -> Result<(), ProtocolError> {
        if self.inner.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotRegistered)
        }
    }
}

#[async_trait]
impl TunnelClient for FramedClient {
    async fn register(&self, cancel: &CancellationToken) -> Result<(), ProtocolError> {
        let transport = self
            .inner
            .transport
            .lock()
            .await
            .take()
            .ok_or(ProtocolError::AlreadyRegistered)?;
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(ProtocolError::AlreadyRegistered)?;

        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        writer
            .send(Frame::control(Message::Register {
                agent: self.inner.agent.clone(),
                version: Some(PROTOCOL_VERSION.to_string()),
            }))
            .await?;

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(ProtocolError::ConnectionClosed),
            reply = reader.next() => reply,
        };

        match reply {
            Some(Ok(Frame {
                message: Message::RegisterAck { accepted: true, .. },
                ..
            })) => {}
            Some(Ok(Frame {
                message: Message::RegisterAck {
                    accepted: false,
                    reason,
                },
                ..
            })) => {
                return Err(ProtocolError::RegistrationRejected(
                    reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            Some(Ok(frame)) => {
                return Err(ProtocolError::UnexpectedMessage(
                    frame.message.message_type(),
                ))
            }
            Some(Err(e)) => return Err(e),
            None => return Err(ProtocolError::ConnectionClosed),
        }

        self.inner.registered.store(true, Ordering::SeqCst);
        tracing::debug!("Agent {} registered with tunnel server", self.inner.agent);

        tokio::spawn(write_loop(Arc::clone(&self.inner), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&self.inner), reader));
        Ok(())
    }

    async fn new_target(&self, target: &Target) -> Result<(), ProtocolError> {
        self.ensure_registered()?;
        self.inner
            .send(Frame::control(Message::NewTarget(target.clone())))
            .await
    }

    async fn delete_target(&self, target: &Target) -> Result<(), ProtocolError> {
        self.ensure_registered()?;
        self.inner
            .send(Frame::control(Message::DeleteTarget(target.clone())))
            .await
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ProtocolError> {
        self.ensure_registered()?;

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.inner.shutdown.cancelled() => {}
        }
        self.inner.shutdown.cancel();

        match self.inner.failure.lock().await.take() {
            Some(reason) => Err(ProtocolError::ConnectionLost(reason)),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl ClientInner {
    async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            sent = self.outbound_tx.send(frame) => sent.map_err(|_| ProtocolError::ConnectionClosed),
        }
    }

    /// Record the first failure cause and stop everything.
    async fn fail(&self, reason: String) {
        {
            let mut failure = self.failure.lock().await;
            if failure.is_none() && !self.shutdown.is_cancelled() {
                *failure = Some(reason);
            }
        }
        self.shutdown.cancel();
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.message {
            Message::StreamOpen(target) => self.open_stream(stream_id, target).await,
            Message::Data(data) => {
                let sender = self.streams.lock().await.get(&stream_id).cloned();
                match sender {
                    Some(sender) => {
                        if sender.send(data).await.is_err() {
                            tracing::debug!("Dropping data for finished {}", stream_id);
                        }
                    }
                    None => tracing::debug!("Data for unknown {}", stream_id),
                }
            }
            Message::StreamClose { error } => {
                if let Some(error) = error {
                    tracing::debug!("Server closed {}: {}", stream_id, error);
                }
                self.streams.lock().await.remove(&stream_id);
            }
            Message::TargetAck {
                target,
                accepted,
                reason,
            } => {
                if accepted {
                    tracing::debug!("Target {} accepted by tunnel server", target);
                } else {
                    tracing::warn!(
                        "Target {} rejected by tunnel server: {}",
                        target,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                }
            }
            Message::Heartbeat { timestamp } => {
                let _ = self
                    .send(Frame::control(Message::HeartbeatAck { timestamp }))
                    .await;
            }
            Message::Error { code, message } => {
                tracing::warn!("Tunnel server error on {} ({:?}): {}", stream_id, code, message);
            }
            other => {
                tracing::warn!(
                    "Unexpected message from tunnel server: {:?}",
                    other.message_type()
                );
            }
        }
    }

    async fn open_stream(self: &Arc<Self>, stream_id: StreamId, target: Target) {
        if stream_id.is_control() {
            tracing::warn!("Ignoring StreamOpen on the control stream");
            return;
        }

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);
        let (data_tx, mut data_rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        self.streams.lock().await.insert(stream_id, data_tx);

        // server -> handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    data = data_rx.recv() => data,
                };
                let Some(data) = data else { break };
                if remote_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = remote_write.shutdown().await;
        });

        // handler -> server
        let inner = Arc::clone(self);
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                let read = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    read = remote_read.read(&mut buf) => read,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame =
                            Frame::new(stream_id, Message::Data(Bytes::copy_from_slice(&buf[..n])));
                        if inner.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("Serving {} for target {}", stream_id, target);
            let result = inner.handler.handle(target, Box::new(local)).await;
            // the handler dropped its end, so the pump drains and stops
            let _ = pump.await;

            let error = result.err().map(|e| e.to_string());
            if let Some(error) = &error {
                tracing::debug!("{} ended with error: {}", stream_id, error);
            }
            inner.streams.lock().await.remove(&stream_id);
            let _ = inner
                .send(Frame::new(stream_id, Message::StreamClose { error }))
                .await;
        });
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: FramedRead<ReadHalf<DynStream>, FrameCodec>) {
    let failure = loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                tracing::trace!("Received {:?} on {}", frame.message.message_type(), frame.stream_id);
                inner.dispatch(frame).await;
            }
            Some(Err(e)) => break format!("protocol error: {}", e),
            None => break "connection closed by tunnel server".to_string(),
        }
    };
    inner.fail(failure).await;
}

async fn write_loop(
    inner: Arc<ClientInner>,
    mut writer: FramedWrite<WriteHalf<DynStream>, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.send(frame).await {
            inner.fail(format!("write failed: {}", e)).await;
            return;
        }
    }
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    type Server = Framed<DuplexStream, FrameCodec>;

    struct Greeter;

    #[async_trait]
    impl InboundHandler for Greeter {
        async fn handle(&self, _target: Target, mut stream: DynStream) -> Result<(), ProtocolError> {
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await?;
            if &buf != b"hello" {
                return Err(ProtocolError::Handler("unexpected greeting".to_string()));
            }
            stream.write_all(b"world").await?;
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl InboundHandler for Refuse {
        async fn handle(&self, target: Target, _stream: DynStream) -> Result<(), ProtocolError> {
            Err(ProtocolError::Handler(format!("no target {}", target)))
        }
    }

    fn pair(handler: Arc<dyn InboundHandler>) -> (FramedClient, Server) {
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);
        let client = FramedClient::new("test-agent", Box::new(agent_side), handler);
        (client, Framed::new(server_side, FrameCodec::new()))
    }

    async fn next_frame(server: &mut Server) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("decode failed")
    }

    async fn accept(server: &mut Server) {
        let frame = next_frame(server).await;
        assert!(matches!(frame.message, Message::Register { ref agent, .. } if agent == "test-agent"));
        server
            .send(Frame::control(Message::RegisterAck {
                accepted: true,
                reason: None,
            }))
            .await
            .unwrap();
    }

    async fn registered(handler: Arc<dyn InboundHandler>) -> (FramedClient, Server) {
        let (client, mut server) = pair(handler);
        let cancel = CancellationToken::new();
        let (result, _) = tokio::join!(client.register(&cancel), accept(&mut server));
        result.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_register_then_announce_target() {
        let (client, mut server) = registered(Arc::new(Greeter)).await;

        let target = Target::new("leaf1", "SSH");
        client.new_target(&target).await.unwrap();
        assert_eq!(next_frame(&mut server).await, Frame::control(Message::NewTarget(target.clone())));

        client.delete_target(&target).await.unwrap();
        assert_eq!(next_frame(&mut server).await, Frame::control(Message::DeleteTarget(target)));
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let (client, mut server) = pair(Arc::new(Greeter));
        let cancel = CancellationToken::new();

        let reject = async {
            let _ = next_frame(&mut server).await;
            server
                .send(Frame::control(Message::RegisterAck {
                    accepted: false,
                    reason: Some("unknown agent".to_string()),
                }))
                .await
                .unwrap();
        };
        let (result, _) = tokio::join!(client.register(&cancel), reject);

        assert!(matches!(result, Err(ProtocolError::RegistrationRejected(reason)) if reason == "unknown agent"));
    }

    #[tokio::test]
    async fn test_target_before_register_fails() {
        let (client, _server) = pair(Arc::new(Greeter));
        let result = client.new_target(&Target::new("a", "b")).await;
        assert!(matches!(result, Err(ProtocolError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_inbound_stream_is_bridged() {
        let (_client, mut server) = registered(Arc::new(Greeter)).await;
        let stream_id = StreamId::new(1);

        server
            .send(Frame::new(stream_id, Message::StreamOpen(Target::new("leaf1", "SSH"))))
            .await
            .unwrap();
        server
            .send(Frame::new(stream_id, Message::Data(Bytes::from_static(b"hello"))))
            .await
            .unwrap();

        let mut received = Vec::new();
        loop {
            let frame = next_frame(&mut server).await;
            assert_eq!(frame.stream_id, stream_id);
            match frame.message {
                Message::Data(data) => received.extend_from_slice(&data),
                Message::StreamClose { error } => {
                    assert!(error.is_none());
                    break;
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(received, b"world");
    }

    #[tokio::test]
    async fn test_handler_error_reported_in_close() {
        let (_client, mut server) = registered(Arc::new(Refuse)).await;

        server
            .send(Frame::new(StreamId::new(4), Message::StreamOpen(Target::new("x", "y"))))
            .await
            .unwrap();

        let frame = next_frame(&mut server).await;
        match frame.message {
            Message::StreamClose { error: Some(error) } => assert!(error.contains("no target x/y")),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_answered() {
        let (_client, mut server) = registered(Arc::new(Greeter)).await;

        server
            .send(Frame::control(Message::Heartbeat { timestamp: 77 }))
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut server).await,
            Frame::control(Message::HeartbeatAck { timestamp: 77 })
        );
    }

    #[tokio::test]
    async fn test_start_reports_server_disconnect() {
        let (client, server) = registered(Arc::new(Greeter)).await;
        drop(server);

        let result = tokio::time::timeout(Duration::from_secs(5), client.start(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_start_returns_ok_when_cancelled() {
        let (client, _server) = registered(Arc::new(Greeter)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(client.start(cancel).await.is_ok());
        assert!(matches!(
            client.new_target(&Target::new("a", "b")).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_serving() {
        let (client, _server) = registered(Arc::new(Greeter)).await;
        client.close();
        assert!(client.start(CancellationToken::new()).await.is_ok());
    }
}
