//! Process-wide pool registry.
//!
//! Maps each target (base URL + sprite name) to its connection pool and to a
//! "control mode believed supported" flag. The registry is an explicit,
//! injectable object rather than module-level global state: a client holds
//! one and shares it across sessions.
//!
//! Pool creation never awaits (connections are dialed lazily on checkout),
//! so a single registry lock serves as the per-key creation critical
//! section: concurrent first checkouts for one target observe exactly one
//! pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::ws_url;

/// Identity of one sprite behind one API host. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub base_url: String,
    pub sprite: String,
}

impl Target {
    pub fn new(base_url: impl Into<String>, sprite: impl Into<String>) -> Target {
        Target {
            base_url: base_url.into(),
            sprite: sprite.into(),
        }
    }

    /// WebSocket URL of this target's control endpoint.
    pub fn control_url(&self) -> String {
        ws_url(&self.base_url, &format!("/v1/sprites/{}/control", self.sprite))
    }

    /// WebSocket URL of this target's exec endpoint, or of an existing
    /// session's attach endpoint.
    pub fn exec_url(&self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => ws_url(&self.base_url, &format!("/v1/sprites/{}/exec/{id}", self.sprite)),
            None => ws_url(&self.base_url, &format!("/v1/sprites/{}/exec", self.sprite)),
        }
    }
}

/// Creates the pool for a target on first use.
pub type PoolFactory = Arc<dyn Fn(&Target) -> ConnectionPool + Send + Sync>;

/// Registry of one pool and one control-support flag per target.
pub struct PoolRegistry {
    pools: Mutex<HashMap<Target, ConnectionPool>>,
    control: Mutex<HashMap<Target, bool>>,
    factory: PoolFactory,
    created: AtomicUsize,
}

impl PoolRegistry {
    /// Registry whose pools dial control endpoints with `token`.
    pub fn new(token: impl Into<String>) -> PoolRegistry {
        let token = token.into();
        Self::with_factory(Arc::new(move |target: &Target| {
            ConnectionPool::new(target.control_url(), token.clone())
        }))
    }

    /// Registry with an injected pool factory. Tests use this to count
    /// creations and to substitute fake transports.
    pub fn with_factory(factory: PoolFactory) -> PoolRegistry {
        PoolRegistry {
            pools: Mutex::new(HashMap::new()),
            control: Mutex::new(HashMap::new()),
            factory,
            created: AtomicUsize::new(0),
        }
    }

    /// The pool for `target`, created on first use. Race-free: the registry
    /// lock is the creation critical section.
    pub fn get_or_create(&self, target: &Target) -> ConnectionPool {
        let mut pools = self.pools.lock();
        pools
            .entry(target.clone())
            .or_insert_with(|| {
                debug!(target: "sprite.pool", sprite = %target.sprite, "creating pool");
                self.created.fetch_add(1, Ordering::SeqCst);
                (self.factory)(target)
            })
            .clone()
    }

    /// Checkout with self-healing: a stale cached pool (its actor is gone,
    /// e.g. after a crash raced the cache) is evicted and replaced, and the
    /// checkout retried exactly once. Any further error surfaces.
    pub async fn checkout(&self, target: &Target) -> Result<PooledConnection> {
        let pool = self.get_or_create(target);
        match pool.checkout().await {
            Err(Error::StalePool) => {
                warn!(target: "sprite.pool", sprite = %target.sprite, "stale pool, recreating");
                self.evict(target, &pool);
                self.get_or_create(target).checkout().await
            }
            other => other,
        }
    }

    /// Whether control mode is believed supported for `target`. Defaults to
    /// true until proven otherwise.
    pub fn control_supported(&self, target: &Target) -> bool {
        self.control.lock().get(target).copied().unwrap_or(true)
    }

    /// Record that `target` rejected a control upgrade with a 404. Future
    /// sessions skip the control attempt and go straight to direct mode.
    pub fn mark_control_unsupported(&self, target: &Target) {
        self.control.lock().insert(target.clone(), false);
    }

    /// Tear down `target`'s pool (e.g. on sprite teardown) and forget it.
    pub async fn close(&self, target: &Target) {
        let pool = self.pools.lock().remove(target);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    /// Number of pools this registry has created. Test instrumentation for
    /// the one-pool-per-target property.
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn evict(&self, target: &Target, stale: &ConnectionPool) {
        let mut pools = self.pools.lock();
        // Another caller may have replaced the entry already; only evict
        // the pool we actually failed against.
        if pools.get(target).is_some_and(|p| p.same_pool(stale)) {
            pools.remove(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::test_util::fake_connector;

    fn fake_registry() -> PoolRegistry {
        PoolRegistry::with_factory(Arc::new(|_target| {
            let (connector, held) = fake_connector();
            // Leak the controllers so fake connections outlive this scope.
            std::mem::forget(held);
            ConnectionPool::with_connector(PoolConfig::default(), connector)
        }))
    }

    fn target() -> Target {
        Target::new("https://api.sprites.test", "db-1")
    }

    #[test]
    fn urls_are_derived_from_target() {
        let t = target();
        assert_eq!(
            t.control_url(),
            "wss://api.sprites.test/v1/sprites/db-1/control"
        );
        assert_eq!(t.exec_url(None), "wss://api.sprites.test/v1/sprites/db-1/exec");
        assert_eq!(
            t.exec_url(Some("s-9")),
            "wss://api.sprites.test/v1/sprites/db-1/exec/s-9"
        );
    }

    #[tokio::test]
    async fn concurrent_first_checkouts_create_one_pool() {
        let registry = Arc::new(fake_registry());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.checkout(&target()).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.pools_created(), 1);
    }

    #[tokio::test]
    async fn distinct_targets_get_distinct_pools() {
        let registry = fake_registry();
        registry.checkout(&target()).await.unwrap();
        registry
            .checkout(&Target::new("https://api.sprites.test", "db-2"))
            .await
            .unwrap();
        assert_eq!(registry.pools_created(), 2);
    }

    #[tokio::test]
    async fn stale_pool_heals_once() {
        let registry = fake_registry();
        let t = target();

        // Prime the cache, then kill the pool behind it.
        let pool = registry.get_or_create(&t);
        pool.close().await;
        while !pool.is_closed() {
            tokio::task::yield_now().await;
        }

        // Checkout still succeeds via evict + recreate + retry.
        let lease = registry.checkout(&t).await.unwrap();
        drop(lease);
        assert_eq!(registry.pools_created(), 2);
    }

    #[tokio::test]
    async fn second_stale_failure_surfaces() {
        // Every pool this factory hands out is the same already-dead pool.
        let (connector, _held) = fake_connector();
        let dead = ConnectionPool::with_connector(PoolConfig::default(), connector);
        dead.close().await;
        while !dead.is_closed() {
            tokio::task::yield_now().await;
        }

        let registry =
            PoolRegistry::with_factory(Arc::new(move |_target| dead.clone()));

        let err = registry.checkout(&target()).await.unwrap_err();
        assert!(matches!(err, Error::StalePool));
        assert_eq!(registry.pools_created(), 2);
    }

    #[test]
    fn control_flag_defaults_to_supported() {
        let registry = fake_registry();
        assert!(registry.control_supported(&target()));
        registry.mark_control_unsupported(&target());
        assert!(!registry.control_supported(&target()));

        // Other targets are unaffected.
        assert!(registry.control_supported(&Target::new("https://api.sprites.test", "db-2")));
    }
}
