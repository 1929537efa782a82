//! Fake transport for unit testing connections and sessions without sockets.
//!
//! Provides an in-memory [`TransportParts`] plus a controller for injecting
//! inbound frames and inspecting what the code under test sent.
//!
//! # Example
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! let conn = ControlConnection::from_parts(parts, None);
//!
//! conn.start_op(owner_tx, "exec", json!({"cmd": ["true"]})).await?;
//! controller.inject_control(&ControlMessage::OpComplete { exit_code: 0 });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sprite_protocol::ControlMessage;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver, WireMessage};

/// Builder for creating fake transport instances.
#[derive(Default)]
pub struct FakeTransportBuilder {}

impl FakeTransportBuilder {
    pub fn new() -> Self {
        Self {}
    }

    /// Build the fake transport, returning [`TransportParts`] for the code
    /// under test and a [`FakeTransportController`] for the test itself.
    pub fn build(self) -> (TransportParts, FakeTransportController) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let fail_sends = Arc::new(AtomicBool::new(false));

        let sender = FakeTransportSender {
            sent: Arc::clone(&sent),
            fail_sends: Arc::clone(&fail_sends),
        };
        let receiver = FakeTransportReceiver {
            inbound_rx,
            message_tx,
        };
        let controller = FakeTransportController {
            inbound_tx: Mutex::new(Some(inbound_tx)),
            sent,
            fail_sends,
        };

        let parts = TransportParts {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
            message_rx,
        };

        (parts, controller)
    }
}

/// Controller for injecting frames and inspecting sent messages.
pub struct FakeTransportController {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    sent: Arc<Mutex<Vec<WireMessage>>>,
    fail_sends: Arc<AtomicBool>,
}

impl FakeTransportController {
    /// Inject a raw inbound frame. Frames injected after [`disconnect`]
    /// are silently dropped.
    ///
    /// [`disconnect`]: FakeTransportController::disconnect
    pub fn inject(&self, message: WireMessage) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Inject an inbound binary frame.
    pub fn inject_binary(&self, bytes: impl Into<Vec<u8>>) {
        self.inject(WireMessage::Binary(bytes.into()));
    }

    /// Inject an inbound text frame.
    pub fn inject_text(&self, text: impl Into<String>) {
        self.inject(WireMessage::Text(text.into()));
    }

    /// Inject an inbound control-channel message.
    pub fn inject_control(&self, message: &ControlMessage) {
        self.inject_text(message.encode());
    }

    /// Simulate the remote side closing the connection. Frames injected
    /// before this call are still delivered first.
    pub fn disconnect(&self) {
        self.inbound_tx.lock().take();
    }

    /// Make every subsequent send fail with a transport error.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Take all sent messages, clearing the buffer.
    pub fn take_sent(&self) -> Vec<WireMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

struct FakeTransportSender {
    sent: Arc<Mutex<Vec<WireMessage>>>,
    fail_sends: Arc<AtomicBool>,
}

impl Transport for FakeTransportSender {
    fn send(
        &mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Transport("fake transport send failure".to_owned()));
            }
            self.sent.lock().push(message);
            Ok(())
        })
    }
}

struct FakeTransportReceiver {
    inbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    message_tx: mpsc::UnboundedSender<WireMessage>,
}

impl TransportReceiver for FakeTransportReceiver {
    fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            while let Some(message) = self.inbound_rx.recv().await {
                if self.message_tx.send(message).is_err() {
                    break;
                }
            }
            Ok(())
        })
    }
}
