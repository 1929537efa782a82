//! Per-target connection pool.
//!
//! The pool is an actor owning a set of [`ControlConnection`]s tagged idle
//! or busy. Checkout hands out an idle connection (or dials a new one below
//! the capacity bound), checkin releases the lease and returns it, and a
//! drain pass closes surplus idle connections once the pool has grown past
//! its high-water mark. Pool state is only ever touched by the pool's own
//! task, reacting to checkout/checkin/monitor messages.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::{ControlConnection, MonitorSender};
use crate::error::{Error, Result};

/// Pool sizing. The defaults match the service limits: hard capacity 100,
/// drain once the pool grows past 20, shrink back down to 10.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_size: usize,
    pub drain_threshold: usize,
    pub drain_target: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 100,
            drain_threshold: 20,
            drain_target: 10,
        }
    }
}

/// Dials one new connection for the pool. The pool passes the connection id
/// and its monitor channel so the connection can report its own death.
pub type Connector = Arc<
    dyn Fn(u64, MonitorSender) -> Pin<Box<dyn Future<Output = Result<ControlConnection>> + Send>>
        + Send
        + Sync,
>;

/// Observable pool state, for callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
}

impl PoolStats {
    pub fn size(&self) -> usize {
        self.idle + self.busy
    }
}

/// Handle to a pool actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
}

/// A checked-out connection. Checks itself back in on drop, so a lease is
/// returned no matter how the session holding it ends.
pub struct PooledConnection {
    id: u64,
    conn: ControlConnection,
    pool: mpsc::UnboundedSender<PoolCommand>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

enum PoolCommand {
    Checkout {
        reply: oneshot::Sender<Result<(u64, ControlConnection)>>,
    },
    Checkin {
        id: u64,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

impl ConnectionPool {
    /// Pool dialing the control endpoint at `url` with `token`.
    pub fn new(url: String, token: String) -> ConnectionPool {
        let connector: Connector = Arc::new(move |id, monitor| {
            let url = url.clone();
            let token = token.clone();
            Box::pin(async move {
                ControlConnection::connect(&url, &token, Some((id, monitor))).await
            })
        });
        Self::with_connector(PoolConfig::default(), connector)
    }

    /// Pool with explicit sizing and connector. Tests use this with the
    /// fake transport.
    pub fn with_connector(config: PoolConfig, connector: Connector) -> ConnectionPool {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let actor = PoolActor {
            cmd_rx,
            monitor_tx,
            monitor_rx,
            entries: HashMap::new(),
            next_id: 0,
            drain_pending: false,
            config,
            connector,
        };
        tokio::spawn(actor.run());
        ConnectionPool { cmd_tx }
    }

    /// Lease a connection: any idle one, or a freshly dialed one while under
    /// capacity. Fails with [`Error::PoolFull`] at the capacity bound and
    /// [`Error::StalePool`] when the pool actor is gone.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Checkout { reply })
            .map_err(|_| Error::StalePool)?;
        let (id, conn) = rx.await.map_err(|_| Error::StalePool)??;
        Ok(PooledConnection {
            id,
            conn,
            pool: self.cmd_tx.clone(),
        })
    }

    /// Current idle/busy counts.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| Error::StalePool)?;
        rx.await.map_err(|_| Error::StalePool)
    }

    /// Close every connection and stop the pool.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// True once the pool actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// True when `other` addresses the same pool actor.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }
}

impl PooledConnection {
    /// The leased connection.
    pub fn connection(&self) -> &ControlConnection {
        &self.conn
    }

    /// Return the connection to its pool. Equivalent to dropping the lease,
    /// but explicit at call sites that care.
    pub fn checkin(self) {}
}

impl Deref for PooledConnection {
    type Target = ControlConnection;

    fn deref(&self) -> &ControlConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // The pool may already be gone; nothing to return to then.
        let _ = self.pool.send(PoolCommand::Checkin { id: self.id });
    }
}

struct PoolActor {
    cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    monitor_tx: MonitorSender,
    monitor_rx: mpsc::UnboundedReceiver<u64>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    drain_pending: bool,
    config: PoolConfig,
    connector: Connector,
}

struct Entry {
    conn: ControlConnection,
    busy: bool,
}

impl PoolActor {
    async fn run(mut self) {
        'run: loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    // All handles dropped: tear the pool down.
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                    // Land every queued command before shrinking, so a
                    // burst of checkins is drainable in one pass.
                    while let Ok(cmd) = self.cmd_rx.try_recv() {
                        if !self.handle_command(cmd).await {
                            break 'run;
                        }
                    }
                    if self.drain_pending {
                        self.drain();
                    }
                },
                Some(id) = self.monitor_rx.recv() => {
                    debug!(target: "sprite.pool", id, "connection died, evicting");
                    self.entries.remove(&id);
                }
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the pool must stop.
    async fn handle_command(&mut self, cmd: PoolCommand) -> bool {
        match cmd {
            PoolCommand::Checkout { reply } => {
                let result = self.checkout().await;
                let _ = reply.send(result);
                true
            }
            PoolCommand::Checkin { id } => {
                self.checkin(id);
                true
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
                true
            }
            PoolCommand::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                false
            }
        }
    }

    fn shutdown(&mut self) {
        for entry in self.entries.values() {
            entry.conn.close();
        }
        self.entries.clear();
    }

    async fn checkout(&mut self) -> Result<(u64, ControlConnection)> {
        self.sweep_dead();

        if let Some((&id, entry)) = self.entries.iter_mut().find(|(_, e)| !e.busy) {
            entry.busy = true;
            return Ok((id, entry.conn.clone()));
        }

        if self.entries.len() >= self.config.max_size {
            return Err(Error::PoolFull(self.entries.len()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let conn = (self.connector)(id, self.monitor_tx.clone()).await?;
        self.entries.insert(
            id,
            Entry {
                conn: conn.clone(),
                busy: true,
            },
        );
        debug!(target: "sprite.pool", id, size = self.entries.len(), "dialed new connection");
        Ok((id, conn))
    }

    fn checkin(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            // Already evicted by the monitor.
            return;
        };
        entry.conn.release();
        entry.busy = false;

        if self.entries.len() > self.config.drain_threshold {
            // The run loop shrinks once the command queue is empty.
            self.drain_pending = true;
        }
    }

    fn drain(&mut self) {
        self.drain_pending = false;
        if self.entries.len() <= self.config.drain_threshold {
            return;
        }
        let excess = self.entries.len() - self.config.drain_target;
        let victims: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.busy)
            .map(|(&id, _)| id)
            .take(excess)
            .collect();
        if victims.len() < excess {
            warn!(
                target: "sprite.pool",
                idle = victims.len(),
                excess,
                "not enough idle connections to drain to target"
            );
        }
        for id in victims {
            if let Some(entry) = self.entries.remove(&id) {
                entry.conn.close();
            }
        }
        debug!(target: "sprite.pool", size = self.entries.len(), "drained pool");
    }

    fn sweep_dead(&mut self) {
        self.entries.retain(|id, entry| {
            let alive = !entry.conn.is_closed();
            if !alive {
                debug!(target: "sprite.pool", id, "dropping dead connection");
            }
            alive
        });
    }

    fn stats(&self) -> PoolStats {
        let busy = self.entries.values().filter(|e| e.busy).count();
        PoolStats {
            idle: self.entries.len() - busy,
            busy,
        }
    }
}
