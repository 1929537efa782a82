//! Exec sessions.
//!
//! An [`ExecSession`] is a handle to a running command inside a sprite. Each
//! session is backed by an actor task that owns the transport side (a
//! dedicated WebSocket in direct mode, a leased pool connection in control
//! mode), decodes inbound frames into [`ExecEvent`]s, and encodes stdin
//! writes and resizes back onto the wire. The handle only passes messages;
//! dropping it tears the session down and, in control mode, returns the
//! lease to its pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use sprite_protocol::{Frame, TextSignal};
use sprite_runtime::{OwnerEvent, PooledConnection, Transport, TransportParts, WireMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A command to run, with its exec options. Builder-style.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    cmd: Vec<String>,
    env: Vec<(String, String)>,
    dir: Option<String>,
    stdin: bool,
    tty: bool,
    rows: Option<u16>,
    cols: Option<u16>,
    detachable: bool,
    max_run_after_disconnect: Option<Duration>,
    control: bool,
    timeout: Option<Duration>,
}

impl ExecCommand {
    pub fn new<I, S>(cmd: I) -> ExecCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecCommand {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..ExecCommand::default()
        }
    }

    /// Shell-style convenience: runs `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> ExecCommand {
        ExecCommand::new(["sh", "-c"]).arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> ExecCommand {
        self.cmd.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> ExecCommand {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory inside the sprite.
    pub fn dir(mut self, dir: impl Into<String>) -> ExecCommand {
        self.dir = Some(dir.into());
        self
    }

    /// Keep stdin open for interactive writes.
    pub fn stdin(mut self, stdin: bool) -> ExecCommand {
        self.stdin = stdin;
        self
    }

    /// Allocate a TTY with the given geometry. TTY sessions carry raw
    /// terminal bytes instead of tagged frames.
    pub fn tty(mut self, rows: u16, cols: u16) -> ExecCommand {
        self.tty = true;
        self.rows = Some(rows);
        self.cols = Some(cols);
        self
    }

    /// Let the command outlive the connection, reattachable by session id.
    pub fn detachable(mut self, detachable: bool) -> ExecCommand {
        self.detachable = detachable;
        self
    }

    /// How long a detachable command keeps running with no client attached.
    pub fn max_run_after_disconnect(mut self, limit: Duration) -> ExecCommand {
        self.max_run_after_disconnect = Some(limit);
        self
    }

    /// Prefer a multiplexed control connection over a dedicated socket.
    pub fn control(mut self, control: bool) -> ExecCommand {
        self.control = control;
        self
    }

    /// Overall deadline for [`ExecSession::wait`] and [`Sprite::run`].
    ///
    /// [`Sprite::run`]: crate::client::Sprite::run
    pub fn timeout(mut self, timeout: Duration) -> ExecCommand {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_tty(&self) -> bool {
        self.tty
    }

    pub(crate) fn control_requested(&self) -> bool {
        self.control
    }

    pub(crate) fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }

    /// Query parameters for the exec endpoints (WebSocket upgrade and POST
    /// alike). `cmd` and `env` repeat; options are omitted when unset.
    pub(crate) fn query_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .cmd
            .iter()
            .map(|arg| ("cmd".to_owned(), arg.clone()))
            .collect();
        // The executable doubles as the session's display path.
        if let Some(first) = self.cmd.first() {
            params.push(("path".into(), first.clone()));
        }
        if self.stdin {
            params.push(("stdin".into(), "true".into()));
        }
        if let Some(dir) = &self.dir {
            params.push(("dir".into(), dir.clone()));
        }
        for (key, value) in &self.env {
            params.push(("env".into(), format!("{key}={value}")));
        }
        if self.tty {
            params.push(("tty".into(), "true".into()));
            if let Some(rows) = self.rows {
                params.push(("rows".into(), rows.to_string()));
            }
            if let Some(cols) = self.cols {
                params.push(("cols".into(), cols.to_string()));
            }
        }
        if self.detachable {
            params.push(("detachable".into(), "true".into()));
        }
        if let Some(limit) = self.max_run_after_disconnect {
            params.push((
                "max_run_after_disconnect".into(),
                limit.as_secs().to_string(),
            ));
        }
        params
    }

    /// Argument object for the control-mode `exec` operation. Same options
    /// as the query string, as structured JSON.
    pub(crate) fn control_args(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("cmd".into(), json!(self.cmd));
        if self.stdin {
            map.insert("stdin".into(), json!(true));
        }
        if let Some(dir) = &self.dir {
            map.insert("dir".into(), json!(dir));
        }
        if !self.env.is_empty() {
            let env: serde_json::Map<String, Value> = self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            map.insert("env".into(), Value::Object(env));
        }
        if self.tty {
            map.insert("tty".into(), json!(true));
            map.insert("rows".into(), json!(self.rows));
            map.insert("cols".into(), json!(self.cols));
        }
        if self.detachable {
            map.insert("detachable".into(), json!(true));
        }
        if let Some(limit) = self.max_run_after_disconnect {
            map.insert("max_run_after_disconnect".into(), json!(limit.as_secs()));
        }
        Value::Object(map)
    }
}

/// One event from a running session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The process exited. Emitted exactly once per session.
    Exit(i32),
    /// A port became reachable inside the sprite.
    Port(u16),
    /// The session failed before a legitimate exit was observed.
    Error(String),
}

/// How a session reaches its sprite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Dedicated WebSocket per session.
    Direct,
    /// Leased slot on a shared, multiplexed control connection.
    Control,
}

/// Handle to a running command. Events are read with [`next_event`] or
/// [`wait`]; stdin writes and resizes go through the `&self` methods, so the
/// handle can be split across tasks with a `&mut` reader and shared writers.
///
/// [`next_event`]: ExecSession::next_event
/// [`wait`]: ExecSession::wait
#[derive(Debug)]
pub struct ExecSession {
    token: u64,
    mode: ExecMode,
    timeout: Option<Duration>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    event_rx: mpsc::UnboundedReceiver<ExecEvent>,
}

enum SessionCommand {
    Write(Vec<u8>),
    CloseStdin,
    Resize { rows: u16, cols: u16 },
}

impl ExecSession {
    /// Process-unique session token, for logging and correlation.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Write bytes to the process's stdin.
    pub fn write_stdin(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(SessionCommand::Write(bytes.into()))
    }

    /// Signal end-of-input. In framed mode this is a zero-length stdin
    /// frame; TTY sessions send an empty raw frame.
    pub fn close_stdin(&self) -> Result<()> {
        self.send(SessionCommand::CloseStdin)
    }

    /// Change the terminal geometry of a TTY session.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.send(SessionCommand::Resize { rows, cols })
    }

    /// Next event, or `None` once the session has terminated and all
    /// buffered events were consumed.
    pub async fn next_event(&mut self) -> Option<ExecEvent> {
        self.event_rx.recv().await
    }

    /// Wait for the process to exit, discarding output events. Honors the
    /// command's [`timeout`](ExecCommand::timeout) if one was set.
    pub async fn wait(&mut self) -> Result<i32> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_inner())
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.wait_inner().await,
        }
    }

    async fn wait_inner(&mut self) -> Result<i32> {
        while let Some(event) = self.event_rx.recv().await {
            match event {
                ExecEvent::Exit(code) => return Ok(code),
                ExecEvent::Error(message) => {
                    return Err(sprite_runtime::Error::Transport(message).into());
                }
                _ => {}
            }
        }
        Err(Error::SessionClosed)
    }

    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::SessionClosed)
    }
}

fn session_channels() -> (
    ExecSessionParts,
    mpsc::UnboundedReceiver<SessionCommand>,
    mpsc::UnboundedSender<ExecEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    (
        ExecSessionParts {
            token,
            cmd_tx,
            event_rx,
        },
        cmd_rx,
        event_tx,
    )
}

struct ExecSessionParts {
    token: u64,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    event_rx: mpsc::UnboundedReceiver<ExecEvent>,
}

impl ExecSessionParts {
    fn into_session(self, mode: ExecMode, timeout: Option<Duration>) -> ExecSession {
        ExecSession {
            token: self.token,
            mode,
            timeout,
            cmd_tx: self.cmd_tx,
            event_rx: self.event_rx,
        }
    }
}

/// Spawn a direct-mode session over an already-upgraded exec socket.
pub(crate) fn spawn_direct(
    parts: TransportParts,
    tty: bool,
    timeout: Option<Duration>,
) -> ExecSession {
    let (session, cmd_rx, event_tx) = session_channels();
    let token = session.token;

    let receiver_task = tokio::spawn(parts.receiver.run());
    let actor = DirectActor {
        sender: parts.sender,
        message_rx: parts.message_rx,
        cmd_rx,
        event_tx,
        tty,
        token,
        exited: false,
    };
    tokio::spawn(async move {
        actor.run().await;
        receiver_task.abort();
    });

    session.into_session(ExecMode::Direct, timeout)
}

/// Spawn a control-mode session over a leased pool connection. The caller
/// has already sent `op.start`; `owner_rx` is the lessee channel registered
/// with it.
pub(crate) fn spawn_control(
    lease: PooledConnection,
    owner_rx: mpsc::UnboundedReceiver<OwnerEvent>,
    tty: bool,
    timeout: Option<Duration>,
) -> ExecSession {
    let (session, cmd_rx, event_tx) = session_channels();
    let token = session.token;

    let actor = ControlActor {
        lease,
        owner_rx,
        cmd_rx,
        event_tx,
        tty,
        token,
        exited: false,
    };
    tokio::spawn(actor.run());

    session.into_session(ExecMode::Control, timeout)
}

struct DirectActor {
    sender: Box<dyn Transport>,
    message_rx: mpsc::UnboundedReceiver<WireMessage>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<ExecEvent>,
    tty: bool,
    token: u64,
    exited: bool,
}

impl DirectActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    // Handle dropped: close the socket by ending the actor.
                    None => break,
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            self.drain_inbox();
                            break;
                        }
                    }
                },
                message = self.message_rx.recv() => match message {
                    Some(message) => {
                        if self.handle_frame(message) {
                            break;
                        }
                    }
                    None => {
                        self.drain_inbox();
                        break;
                    }
                },
            }
        }
        debug!(target: "sprite.exec", token = self.token, "direct session ended");
    }

    /// Returns `false` when the transport is gone and the session must end.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        let message = match cmd {
            SessionCommand::Write(bytes) if self.tty => WireMessage::Binary(bytes),
            SessionCommand::Write(bytes) => WireMessage::Binary(Frame::Stdin(bytes).encode()),
            SessionCommand::CloseStdin if self.tty => WireMessage::Binary(Vec::new()),
            SessionCommand::CloseStdin => WireMessage::Binary(Frame::StdinEof.encode()),
            SessionCommand::Resize { rows, cols } => {
                WireMessage::Text(TextSignal::Resize { rows, cols }.encode())
            }
        };
        match self.sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "sprite.exec", token = self.token, error = %e, "send failed");
                false
            }
        }
    }

    /// Returns `true` once a terminal event was emitted.
    fn handle_frame(&mut self, message: WireMessage) -> bool {
        match message {
            WireMessage::Binary(bytes) => {
                let frame = if self.tty {
                    Frame::decode_tty(&bytes)
                } else {
                    Frame::decode(&bytes)
                };
                self.handle_decoded(frame)
            }
            WireMessage::Text(text) => match TextSignal::parse(&text) {
                Some(TextSignal::Exit { code }) => self.emit_exit(code),
                Some(TextSignal::Port { port }) => {
                    self.emit(ExecEvent::Port(port));
                    false
                }
                Some(TextSignal::Resize { .. }) | None => {
                    debug!(target: "sprite.exec", token = self.token, "ignoring text frame");
                    false
                }
            },
        }
    }

    fn handle_decoded(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Stdout(data) => self.emit(ExecEvent::Stdout(data)),
            Frame::Stderr(data) => self.emit(ExecEvent::Stderr(data)),
            Frame::Exit(code) => return self.emit_exit(code),
            Frame::Stdin(_) | Frame::StdinEof => {
                debug!(target: "sprite.exec", token = self.token, "ignoring inbound stdin frame");
            }
            Frame::Unknown { tag, .. } => {
                debug!(target: "sprite.exec", token = self.token, tag, "ignoring unknown frame");
            }
        }
        false
    }

    /// The transport went down. An exit frame may already sit in the inbox
    /// behind the close notification; consume what is queued before calling
    /// the session failed.
    fn drain_inbox(&mut self) {
        while let Ok(message) = self.message_rx.try_recv() {
            if self.handle_frame(message) {
                return;
            }
        }
        if !self.exited {
            self.emit(ExecEvent::Error("connection closed before exit".into()));
        }
    }

    fn emit_exit(&mut self, code: i32) -> bool {
        if !self.exited {
            self.exited = true;
            self.emit(ExecEvent::Exit(code));
        }
        true
    }

    fn emit(&mut self, event: ExecEvent) {
        let _ = self.event_tx.send(event);
    }
}

struct ControlActor {
    lease: PooledConnection,
    owner_rx: mpsc::UnboundedReceiver<OwnerEvent>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<ExecEvent>,
    tty: bool,
    token: u64,
    exited: bool,
}

impl ControlActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    // Abandoned session: stop reading. Dropping the lease
                    // below returns the connection to its pool.
                    None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.owner_rx.recv() => match event {
                    Some(event) => {
                        if self.handle_owner_event(event) {
                            break;
                        }
                    }
                    None => {
                        if !self.exited {
                            self.emit(ExecEvent::Error("connection closed before exit".into()));
                        }
                        break;
                    }
                },
            }
        }
        debug!(target: "sprite.exec", token = self.token, "control session ended");
        // PooledConnection checks itself in on drop.
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        let result = match cmd {
            SessionCommand::Write(bytes) if self.tty => self.lease.send_binary(bytes),
            SessionCommand::Write(bytes) => self.lease.send_binary(Frame::Stdin(bytes).encode()),
            SessionCommand::CloseStdin if self.tty => self.lease.send_binary(Vec::new()),
            SessionCommand::CloseStdin => self.lease.send_binary(Frame::StdinEof.encode()),
            SessionCommand::Resize { rows, cols } => self
                .lease
                .send_text(TextSignal::Resize { rows, cols }.encode()),
        };
        // A failed send means the connection actor is gone; its op.error
        // arrives through owner_rx and ends the session there.
        if let Err(e) = result {
            warn!(target: "sprite.exec", token = self.token, error = %e, "send failed");
        }
    }

    /// Returns `true` when the operation finished and the lease can go back.
    ///
    /// An in-band exit (frame or signal) is surfaced immediately, but only
    /// `op.complete`/`op.error` ends the session: payload frames and the
    /// completion envelope may interleave, and the server owns the ordering.
    fn handle_owner_event(&mut self, event: OwnerEvent) -> bool {
        match event {
            OwnerEvent::Binary(bytes) => {
                let frame = if self.tty {
                    Frame::decode_tty(&bytes)
                } else {
                    Frame::decode(&bytes)
                };
                match frame {
                    Frame::Stdout(data) => self.emit(ExecEvent::Stdout(data)),
                    Frame::Stderr(data) => self.emit(ExecEvent::Stderr(data)),
                    Frame::Exit(code) => self.emit_exit(code),
                    Frame::Stdin(_) | Frame::StdinEof => {}
                    Frame::Unknown { tag, .. } => {
                        debug!(target: "sprite.exec", token = self.token, tag, "ignoring unknown frame");
                    }
                }
                false
            }
            OwnerEvent::Text(text) => {
                match TextSignal::parse(&text) {
                    Some(TextSignal::Exit { code }) => self.emit_exit(code),
                    Some(TextSignal::Port { port }) => self.emit(ExecEvent::Port(port)),
                    Some(TextSignal::Resize { .. }) | None => {
                        debug!(target: "sprite.exec", token = self.token, "ignoring text frame");
                    }
                }
                false
            }
            OwnerEvent::OpComplete { exit_code } => {
                self.emit_exit(exit_code);
                true
            }
            OwnerEvent::OpError { message } => {
                if !self.exited {
                    self.emit(ExecEvent::Error(message));
                }
                true
            }
        }
    }

    fn emit_exit(&mut self, code: i32) {
        // The first exit observed wins; op.complete after an in-band exit
        // only terminates the session.
        if !self.exited {
            self.exited = true;
            self.emit(ExecEvent::Exit(code));
        }
    }

    fn emit(&mut self, event: ExecEvent) {
        let _ = self.event_tx.send(event);
    }
}
