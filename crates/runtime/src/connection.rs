//! Multiplexed control connection.
//!
//! One [`ControlConnection`] is one physical WebSocket to a target's control
//! endpoint. It runs at most one operation at a time: a session leases the
//! connection with [`start_op`], receives every non-control frame until the
//! server reports `op.complete` or `op.error`, and the connection then
//! returns to the ready state for the next lessee.
//!
//! The connection is an actor: a spawned task owns the transport and the
//! lease, and the [`ControlConnection`] handle only passes messages to it.
//! Frames are forwarded to the current lessee in arrival order.
//!
//! [`start_op`]: ControlConnection::start_op

use serde_json::Value;
use sprite_protocol::ControlMessage;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{self, Transport, TransportParts, WireMessage};

/// Events delivered to the current lessee of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerEvent {
    /// A binary payload frame, forwarded verbatim.
    Binary(Vec<u8>),
    /// A non-control text frame, forwarded verbatim.
    Text(String),
    /// The server completed the active operation. Authoritative.
    OpComplete { exit_code: i32 },
    /// The server failed the active operation, or the connection died while
    /// the operation was in flight.
    OpError { message: String },
}

/// Sender half of a lessee's event channel.
pub type OwnerSender = mpsc::UnboundedSender<OwnerEvent>;

/// Death notice channel: a connection reports its id here exactly once when
/// its actor stops, so the owning pool can evict it.
pub type MonitorSender = mpsc::UnboundedSender<u64>;

/// Handle to a connection actor. Cheap to clone; all clones address the same
/// underlying connection.
#[derive(Clone)]
pub struct ControlConnection {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
}

enum ConnCommand {
    StartOp {
        op: String,
        args: Value,
        owner: OwnerSender,
        reply: oneshot::Sender<Result<()>>,
    },
    Release,
    SendBinary(Vec<u8>),
    SendText(String),
    Close,
}

impl ControlConnection {
    /// Upgrade to the control endpoint and spawn the connection actor.
    ///
    /// A 404 on the upgrade means the target does not support control mode
    /// and surfaces as [`Error::ControlUnsupported`].
    pub async fn connect(
        url: &str,
        token: &str,
        monitor: Option<(u64, MonitorSender)>,
    ) -> Result<ControlConnection> {
        let parts = transport::connect(url, token).await?;
        Ok(Self::from_parts(parts, monitor))
    }

    /// Spawn the connection actor over an already-connected transport.
    /// Used directly by tests with the [`crate::fake`] transport.
    pub fn from_parts(
        parts: TransportParts,
        monitor: Option<(u64, MonitorSender)>,
    ) -> ControlConnection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let receiver_task = tokio::spawn(parts.receiver.run());

        let actor = ConnActor {
            sender: parts.sender,
            message_rx: parts.message_rx,
            cmd_rx,
            lease: None,
            monitor,
        };
        tokio::spawn(async move {
            actor.run().await;
            receiver_task.abort();
        });

        ControlConnection { cmd_tx }
    }

    /// Lease the connection and start an operation.
    ///
    /// Sends the `op.start` envelope and forwards all subsequent payload
    /// frames to `owner` until `op.complete`/`op.error`. Fails with
    /// [`Error::OperationInProgress`] when another operation holds the lease.
    pub async fn start_op(&self, owner: OwnerSender, op: &str, args: Value) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCommand::StartOp {
                op: op.to_owned(),
                args,
                owner,
                reply,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Drop the active lease. Late frames for the released operation have no
    /// observer and are discarded.
    pub fn release(&self) {
        let _ = self.cmd_tx.send(ConnCommand::Release);
    }

    /// Send a binary payload frame. Accepted while unleased, but nothing
    /// will observe the reply; that is the caller's responsibility.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(ConnCommand::SendBinary(bytes))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send a text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.cmd_tx
            .send(ConnCommand::SendText(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Close the connection and stop its actor.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ConnCommand::Close);
    }

    /// True once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

struct ConnActor {
    sender: Box<dyn Transport>,
    message_rx: mpsc::UnboundedReceiver<WireMessage>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    lease: Option<OwnerSender>,
    monitor: Option<(u64, MonitorSender)>,
}

impl ConnActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    // All handles dropped: tear the connection down.
                    None | Some(ConnCommand::Close) => break,
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                },
                message = self.message_rx.recv() => match message {
                    Some(message) => self.handle_frame(message),
                    None => {
                        debug!(target: "sprite.conn", "transport closed");
                        self.fail_lease("connection closed before operation completed");
                        break;
                    }
                },
            }
        }
        self.notify_monitor();
    }

    /// Returns `false` when the connection must shut down.
    async fn handle_command(&mut self, cmd: ConnCommand) -> bool {
        match cmd {
            ConnCommand::StartOp {
                op,
                args,
                owner,
                reply,
            } => {
                if self.lease.is_some() {
                    let _ = reply.send(Err(Error::OperationInProgress));
                    return true;
                }
                let frame = ControlMessage::OpStart { op, args }.encode();
                match self.sender.send(WireMessage::Text(frame)).await {
                    Ok(()) => {
                        self.lease = Some(owner);
                        let _ = reply.send(Ok(()));
                        true
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        false
                    }
                }
            }
            ConnCommand::Release => {
                self.lease = None;
                true
            }
            ConnCommand::SendBinary(bytes) => {
                self.send_or_fail(WireMessage::Binary(bytes)).await
            }
            ConnCommand::SendText(text) => self.send_or_fail(WireMessage::Text(text)).await,
            ConnCommand::Close => false,
        }
    }

    async fn send_or_fail(&mut self, message: WireMessage) -> bool {
        match self.sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "sprite.conn", error = %e, "send failed, closing connection");
                self.fail_lease("connection lost while sending");
                false
            }
        }
    }

    fn handle_frame(&mut self, message: WireMessage) {
        match message {
            WireMessage::Binary(bytes) => self.forward(OwnerEvent::Binary(bytes)),
            WireMessage::Text(text) => match ControlMessage::parse(&text) {
                None => self.forward(OwnerEvent::Text(text)),
                Some(Ok(ControlMessage::OpComplete { exit_code })) => {
                    if let Some(owner) = self.lease.take() {
                        let _ = owner.send(OwnerEvent::OpComplete { exit_code });
                    } else {
                        debug!(target: "sprite.conn", exit_code, "op.complete without lease");
                    }
                }
                Some(Ok(ControlMessage::OpError { message })) => {
                    if let Some(owner) = self.lease.take() {
                        let _ = owner.send(OwnerEvent::OpError { message });
                    } else {
                        debug!(target: "sprite.conn", message, "op.error without lease");
                    }
                }
                Some(Ok(ControlMessage::OpStart { op, .. })) => {
                    warn!(target: "sprite.conn", op, "unexpected inbound op.start, dropping");
                }
                Some(Err(e)) => {
                    warn!(target: "sprite.conn", error = %e, "malformed control frame, dropping");
                }
            },
        }
    }

    fn forward(&mut self, event: OwnerEvent) {
        if let Some(owner) = &self.lease {
            if owner.send(event).is_err() {
                // Lessee went away without releasing; drop the lease so the
                // connection can be reused.
                self.lease = None;
            }
        }
    }

    fn fail_lease(&mut self, message: &str) {
        if let Some(owner) = self.lease.take() {
            let _ = owner.send(OwnerEvent::OpError {
                message: message.to_owned(),
            });
        }
    }

    fn notify_monitor(&mut self) {
        if let Some((id, monitor)) = self.monitor.take() {
            let _ = monitor.send(id);
        }
    }
}
