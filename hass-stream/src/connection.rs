//! Connection state machine
//!
//! # Architecture
//!
//! ```text
//! callers ──call_command──► [id lock] ──Outbound──► IO task ──► Transport
//!    ▲                          │                      │
//!    │                    PendingRequests ◄──result────┤
//!    └───────oneshot─────────────┘                     └──event──► FrameHandler
//! ```
//!
//! One IO task per connection owns the transport. It is the only reader and
//! the only writer: callers hand it encoded frames through an unbounded
//! queue, and ids are allocated under the same lock that enqueues the frame,
//! so ids reach the wire in increasing order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hass_api::{codec, AuthMessage, Command, ServerMessage};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::correlator::{CommandOutcome, PendingRequests};
use crate::error::{ConnectionError, Result};
use crate::handler::FrameHandler;
use crate::phase::ConnectionPhase;
use crate::transport::{Transport, WebSocketTransport};

/// Work handed to the IO task
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Id allocation and the outbound queue, guarded together
struct SendState {
    next_id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// State shared by the connection handle and its IO task
struct Shared {
    config: ConnectionConfig,
    phase: watch::Sender<ConnectionPhase>,
    pending: PendingRequests,
    sender: Mutex<SendState>,
    ha_version: RwLock<Option<String>>,
}

impl Shared {
    fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, next: ConnectionPhase) {
        let previous = self.phase();
        if previous.can_transition_to(next) {
            self.phase.send_replace(next);
            tracing::debug!(from = %previous, to = %next, "Connection phase changed");
        } else if previous != next {
            tracing::warn!(from = %previous, to = %next, "Ignoring illegal phase transition");
        }
    }

    /// Enter `Closed` and fail everything still waiting
    fn mark_closed(&self) {
        self.set_phase(ConnectionPhase::Closed);
        self.pending.fail_all(|| ConnectionError::ConnectionClosed);
    }

    fn log_frame(&self, direction: &str, frame: &str) {
        if self.config.debug {
            tracing::debug!(direction, frame, "Protocol frame");
        } else {
            tracing::trace!(direction, frame, "Protocol frame");
        }
    }
}

/// An authenticated session with the server
///
/// Created by [`Connection::open`] (WebSocket) or
/// [`Connection::with_transport`] (any [`Transport`]); both return only once
/// the connection is `Ready`. Dropping the handle closes the session.
pub struct Connection {
    shared: Arc<Shared>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dial the server over WebSocket and authenticate
    pub async fn open(config: ConnectionConfig, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        config.validate()?;
        let transport = WebSocketTransport::connect(&config).await?;
        Self::with_transport(config, Box::new(transport), handler).await
    }

    /// Authenticate over an already established transport
    pub async fn with_transport(
        config: ConnectionConfig,
        mut transport: Box<dyn Transport>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connect_timeout = config.connect_timeout;
        let shared = Arc::new(Shared {
            config,
            phase,
            pending: PendingRequests::new(),
            sender: Mutex::new(SendState {
                next_id: 1,
                outbound: outbound_tx,
            }),
            ha_version: RwLock::new(None),
        });

        shared.set_phase(ConnectionPhase::Connecting);

        let handshake = Self::handshake(&shared, transport.as_mut());
        let failure = match tokio::time::timeout(connect_timeout, handshake).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(ConnectionError::ConnectTimeout(connect_timeout)),
        };

        if let Some(error) = failure {
            tracing::warn!(error = %error, "Handshake failed");
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "Error closing transport after failed handshake");
            }
            shared.mark_closed();
            handler.on_closed();
            return Err(error);
        }

        shared.set_phase(ConnectionPhase::Ready);
        tracing::info!(
            ha_version = shared.ha_version.read().as_deref().unwrap_or("unknown"),
            "Connected and authenticated"
        );

        let io_task = tokio::spawn(Self::run_io(
            Arc::clone(&shared),
            transport,
            outbound_rx,
            handler,
        ));

        Ok(Self {
            shared,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    async fn handshake(shared: &Shared, transport: &mut dyn Transport) -> Result<()> {
        loop {
            let frame = match transport.recv().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ConnectionError::Protocol(
                        "connection closed during authentication".to_string(),
                    ))
                }
            };
            shared.log_frame("recv", &frame);

            match codec::decode(&frame) {
                Ok(ServerMessage::AuthRequired { ha_version }) => {
                    *shared.ha_version.write() = ha_version;
                    shared.set_phase(ConnectionPhase::Authenticating);

                    let auth = codec::encode_auth(&AuthMessage::new(&shared.config.access_token))?;
                    tracing::debug!("Sending auth frame");
                    transport.send(auth).await?;
                }
                Ok(ServerMessage::AuthOk { ha_version }) => {
                    if ha_version.is_some() {
                        *shared.ha_version.write() = ha_version;
                    }
                    return Ok(());
                }
                Ok(ServerMessage::AuthInvalid { message }) => {
                    return Err(ConnectionError::AuthFailed(
                        message.unwrap_or_else(|| "invalid access token".to_string()),
                    ));
                }
                Ok(other) => {
                    tracing::debug!(?other, "Ignoring frame received before authentication");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring undecodable frame during handshake");
                }
            }
        }
    }

    /// The receive loop: sole reader and writer of the transport
    async fn run_io(
        shared: Arc<Shared>,
        mut transport: Box<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        handler: Arc<dyn FrameHandler>,
    ) {
        let reason = loop {
            tokio::select! {
                command = outbound.recv() => match command {
                    Some(Outbound::Frame(frame)) => {
                        shared.log_frame("send", &frame);
                        if let Err(e) = transport.send(frame).await {
                            break format!("send failed: {}", e);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        if let Err(e) = transport.close().await {
                            tracing::debug!(error = %e, "Error closing transport");
                        }
                        break "closed by client".to_string();
                    }
                },
                incoming = transport.recv() => match incoming {
                    Some(Ok(frame)) => {
                        shared.log_frame("recv", &frame);
                        if let Err(e) = Self::handle_frame(&shared, transport.as_mut(), handler.as_ref(), &frame).await {
                            break format!("failed to answer frame: {}", e);
                        }
                    }
                    Some(Err(e)) => break format!("receive failed: {}", e),
                    None => break "closed by server".to_string(),
                },
            }
        };

        tracing::info!(reason = %reason, "Connection closed");
        shared.mark_closed();
        handler.on_closed();
    }

    async fn handle_frame(
        shared: &Shared,
        transport: &mut dyn Transport,
        handler: &dyn FrameHandler,
        frame: &str,
    ) -> Result<()> {
        match codec::decode(frame) {
            Ok(ServerMessage::Result(result)) => {
                let id = result.id;
                let outcome: CommandOutcome =
                    result
                        .into_outcome()
                        .map_err(|error| ConnectionError::CommandFailed {
                            code: error.code,
                            message: error.message,
                        });
                shared.pending.resolve(id, outcome);
            }
            Ok(ServerMessage::Pong { id }) => {
                shared.pending.resolve(id, Ok(Value::Null));
            }
            Ok(ServerMessage::Ping { id }) => {
                let pong = codec::encode_command(id, &Command::Pong)?;
                shared.log_frame("send", &pong);
                transport.send(pong).await?;
            }
            Ok(ServerMessage::Event(message)) => {
                handler.on_event(message.event);
            }
            Ok(other) => {
                tracing::debug!(?other, "Ignoring unexpected frame");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unrecognized frame");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send a command and wait for its `result`
    ///
    /// `timeout` overrides the configured `request_timeout` for this call.
    /// On expiry the pending entry is removed, so a late response is dropped.
    pub async fn call_command(&self, command: Command, timeout: Option<Duration>) -> Result<Value> {
        let kind = command.kind();
        let (id, completion) = self.enqueue(&command)?;
        tracing::debug!(id, kind, "Command sent");

        let deadline = timeout.or(self.shared.config.request_timeout);
        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(received) => received,
                Err(_) => {
                    self.shared.pending.remove(id);
                    tracing::warn!(id, kind, timeout = ?limit, "Command timed out");
                    return Err(ConnectionError::RequestTimeout { id, timeout: limit });
                }
            },
            None => completion.await,
        };

        received.map_err(|_| ConnectionError::ConnectionClosed)?
    }

    /// Allocate an id, register it and queue the frame, all under one lock
    fn enqueue(&self, command: &Command) -> Result<(u64, oneshot::Receiver<CommandOutcome>)> {
        let mut sender = self.shared.sender.lock();

        let phase = self.shared.phase();
        if !phase.is_ready() {
            return Err(ConnectionError::NotConnected(phase));
        }

        let id = sender.next_id;
        let frame = codec::encode_command(id, command)?;
        let completion = self.shared.pending.register(id)?;

        if sender.outbound.send(Outbound::Frame(frame)).is_err() {
            self.shared.pending.remove(id);
            return Err(ConnectionError::ConnectionClosed);
        }
        sender.next_id += 1;

        Ok((id, completion))
    }

    /// Round-trip a `ping`, returning the measured latency
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration> {
        let started = Instant::now();
        self.call_command(Command::Ping, timeout).await?;
        Ok(started.elapsed())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the session and wait until the IO task has wound down
    pub async fn close(&self) {
        self.request_close();
        self.closed().await;

        let task = self.io_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Connection IO task ended abnormally");
            }
        }
    }

    /// Wait until the connection reaches `Closed`, for whatever reason
    pub async fn closed(&self) {
        let mut phase = self.shared.phase.subscribe();
        // The sender lives in `shared`, which outlives this call
        let _ = phase.wait_for(|p| p.is_closed()).await;
    }

    fn request_close(&self) {
        let sender = self.shared.sender.lock();
        let _ = sender.outbound.send(Outbound::Close);
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.phase()
    }

    /// Observe phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.phase().is_ready()
    }

    /// Server version reported during the handshake
    pub fn ha_version(&self) -> Option<String> {
        self.shared.ha_version.read().clone()
    }

    /// Number of commands still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.request_close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase())
            .field("pending", &self.pending_count())
            .field("ha_version", &self.ha_version())
            .finish()
    }
}
