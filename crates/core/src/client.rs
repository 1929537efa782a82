//! Client handle for one sprite.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sprite_protocol::ExecResponse;
use sprite_runtime::{PoolRegistry, Target, transport};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::session::{self, ExecCommand, ExecEvent, ExecSession};
use crate::stream::{DEFAULT_IDLE_TIMEOUT, EventStream, default_parser};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to one sprite behind one API host.
///
/// Cheap to clone. Clones created through [`with_registry`] share connection
/// pools and the per-target control-support flag, so many handles to sprites
/// on one host reuse the same multiplexed connections.
///
/// [`with_registry`]: Sprite::with_registry
#[derive(Clone)]
pub struct Sprite {
    target: Target,
    token: String,
    registry: Arc<PoolRegistry>,
    http: reqwest::Client,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

/// Captured output of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl std::fmt::Debug for Sprite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sprite")
            .field("target", &self.target)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Sprite {
    /// Handle for `sprite` at `base_url`, with its own registry.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        sprite: impl Into<String>,
    ) -> Result<Sprite> {
        let token = token.into();
        let registry = Arc::new(PoolRegistry::new(token.clone()));
        Self::with_registry(base_url, token, sprite, registry)
    }

    /// Handle sharing an existing registry (and thus its pools) with other
    /// handles.
    pub fn with_registry(
        base_url: impl Into<String>,
        token: impl Into<String>,
        sprite: impl Into<String>,
        registry: Arc<PoolRegistry>,
    ) -> Result<Sprite> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|e| Error::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Sprite {
            target: Target::new(base_url, sprite),
            token: token.into(),
            registry,
            http: reqwest::Client::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Deadline for connection establishment and non-streaming requests.
    pub fn connect_timeout(mut self, timeout: Duration) -> Sprite {
        self.connect_timeout = timeout;
        self
    }

    /// Maximum gap between chunks on streaming responses.
    pub fn idle_timeout(mut self, timeout: Duration) -> Sprite {
        self.idle_timeout = timeout;
        self
    }

    /// Start a command and return a live session.
    ///
    /// A command marked [`control`](ExecCommand::control) first tries a
    /// leased slot on the target's pooled control connection; if the target
    /// does not support control mode (or every attempt to lease fails), the
    /// session falls back to a dedicated exec socket and the outcome is
    /// remembered per target.
    pub async fn exec(&self, command: ExecCommand) -> Result<ExecSession> {
        if command.control_requested() && self.registry.control_supported(&self.target) {
            match self.exec_control(&command).await {
                Ok(session) => return Ok(session),
                Err(Error::Runtime(e)) if e.is_control_unsupported() => {
                    debug!(
                        target: "sprite.exec",
                        sprite = %self.target.sprite,
                        "control mode unsupported, using direct exec"
                    );
                    self.registry.mark_control_unsupported(&self.target);
                }
                Err(e) => {
                    warn!(
                        target: "sprite.exec",
                        sprite = %self.target.sprite,
                        error = %e,
                        "control exec failed, falling back to direct"
                    );
                }
            }
        }
        self.exec_direct(&command, None).await
    }

    /// Reattach to a detachable command by its session id. Always direct.
    pub async fn attach(&self, session_id: &str, options: ExecCommand) -> Result<ExecSession> {
        self.exec_direct(&options, Some(session_id)).await
    }

    /// Run a command to completion, capturing stdout and stderr.
    pub async fn run(&self, command: ExecCommand) -> Result<ExecOutput> {
        let limit = command.timeout_limit();
        let mut session = self.exec(command).await?;
        match limit {
            Some(limit) => tokio::time::timeout(limit, collect_output(&mut session))
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => collect_output(&mut session).await,
        }
    }

    /// One-shot exec over plain HTTP POST: the request body is stdin and
    /// the decoded response carries the captured output.
    pub async fn exec_post(
        &self,
        command: &ExecCommand,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResponse> {
        let url = self.http_url(&format!("/v1/sprites/{}/exec", self.target.sprite))?;
        let mut request = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .query(&command.query_params());
        if let Some(body) = stdin {
            request = request.body(body);
        }
        let response = self.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(sprite_protocol::ApiError::from_body(status.as_u16(), &body).into());
        }
        Ok(response.json().await?)
    }

    /// POST to a streaming endpoint and decode the NDJSON response.
    pub async fn stream_post(&self, path: &str, body: Option<Value>) -> Result<EventStream> {
        let url = self.http_url(path)?;
        let mut request = self.http.post(url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = self.send(request).await?;
        EventStream::with_parser(response, self.idle_timeout, default_parser()).await
    }

    /// GET a streaming endpoint and decode the NDJSON response.
    pub async fn stream_get(&self, path: &str) -> Result<EventStream> {
        let url = self.http_url(path)?;
        let request = self.http.get(url).bearer_auth(&self.token);
        let response = self.send(request).await?;
        EventStream::with_parser(response, self.idle_timeout, default_parser()).await
    }

    /// Kill a detached session by id, streaming teardown progress.
    pub async fn kill_session(&self, session_id: &str) -> Result<EventStream> {
        self.stream_post(
            &format!(
                "/v1/sprites/{}/sessions/{session_id}/kill",
                self.target.sprite
            ),
            None,
        )
        .await
    }

    /// Tear down this target's connection pool. Live direct sessions are
    /// unaffected; control sessions lose their connections.
    pub async fn close(&self) {
        self.registry.close(&self.target).await;
    }

    async fn exec_control(&self, command: &ExecCommand) -> Result<ExecSession> {
        let lease = self.registry.checkout(&self.target).await?;
        let (owner_tx, owner_rx) = mpsc::unbounded_channel();
        lease
            .start_op(owner_tx, "exec", command.control_args())
            .await?;
        Ok(session::spawn_control(
            lease,
            owner_rx,
            command.is_tty(),
            command.timeout_limit(),
        ))
    }

    async fn exec_direct(
        &self,
        command: &ExecCommand,
        attach: Option<&str>,
    ) -> Result<ExecSession> {
        let url = self.exec_ws_url(attach, command)?;
        let connect = transport::connect(&url, &self.token);
        let parts = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => return Err(Error::Timeout(self.connect_timeout)),
            // On the exec endpoint a 404 is a missing sprite or session, not
            // a capability probe.
            Ok(Err(e)) if e.is_control_unsupported() => {
                return Err(Error::Api(sprite_protocol::ApiError::from_status(404)));
            }
            Ok(result) => result?,
        };
        Ok(session::spawn_direct(
            parts,
            command.is_tty(),
            command.timeout_limit(),
        ))
    }

    fn exec_ws_url(&self, attach: Option<&str>, command: &ExecCommand) -> Result<String> {
        let base = self.target.exec_url(attach);
        let mut url = Url::parse(&base).map_err(|e| Error::InvalidUrl(format!("{base}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in command.query_params() {
                query.append_pair(&key, &value);
            }
        }
        Ok(url.into())
    }

    fn http_url(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.target.base_url.trim_end_matches('/'), path);
        Url::parse(&url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        match tokio::time::timeout(self.connect_timeout, request.send()).await {
            Err(_) => Err(Error::Timeout(self.connect_timeout)),
            Ok(response) => Ok(response?),
        }
    }
}

async fn collect_output(session: &mut ExecSession) -> Result<ExecOutput> {
    let mut output = ExecOutput::default();
    while let Some(event) = session.next_event().await {
        match event {
            ExecEvent::Stdout(data) => output.stdout.extend_from_slice(&data),
            ExecEvent::Stderr(data) => output.stderr.extend_from_slice(&data),
            ExecEvent::Exit(code) => {
                output.exit_code = code;
                return Ok(output);
            }
            ExecEvent::Error(message) => {
                return Err(sprite_runtime::Error::Transport(message).into());
            }
            ExecEvent::Port(_) => {}
        }
    }
    Err(Error::SessionClosed)
}
