//! In-memory lock manager
//!
//! Reader/writer locks per resource, held re-entrantly by client id. A client
//! that cannot be granted a lock records what it waits for; before parking,
//! the wait-for graph is walked and a path back to the requester is reported
//! as a deadlock instead of blocking forever.
//! For production use this is replaced by the storage engine's lock manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::manager::{LockClient, LockError, LockManager};
use crate::model::{LockMode, LockStats, LockableResource};

#[derive(Default)]
struct ResourceLock {
    shared: HashMap<u64, u32>,
    exclusive: Option<(u64, u32)>,
}

impl ResourceLock {
    /// Clients other than `client` whose holds conflict with `mode`
    fn blockers(&self, client: u64, mode: LockMode) -> Vec<u64> {
        let mut blockers = Vec::new();
        if let Some((owner, _)) = self.exclusive
            && owner != client
        {
            blockers.push(owner);
        }
        if mode == LockMode::Exclusive {
            blockers.extend(self.shared.keys().copied().filter(|holder| *holder != client));
        }
        blockers
    }

    fn grant(&mut self, client: u64, mode: LockMode) {
        match mode {
            LockMode::Shared => *self.shared.entry(client).or_insert(0) += 1,
            LockMode::Exclusive => {
                let count = match self.exclusive {
                    Some((owner, count)) if owner == client => count + 1,
                    _ => 1,
                };
                self.exclusive = Some((client, count));
            }
        }
    }

    fn release_client(&mut self, client: u64) -> bool {
        let had_shared = self.shared.remove(&client).is_some();
        let had_exclusive = matches!(self.exclusive, Some((owner, _)) if owner == client);
        if had_exclusive {
            self.exclusive = None;
        }
        had_shared || had_exclusive
    }

    fn is_held_by(&self, client: u64) -> bool {
        self.shared.contains_key(&client)
            || matches!(self.exclusive, Some((owner, _)) if owner == client)
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<LockableResource, ResourceLock>,
    waiting: HashMap<u64, (LockableResource, LockMode)>,
}

impl LockTable {
    fn try_grant(&mut self, client: u64, resource: &LockableResource, mode: LockMode) -> bool {
        let lock = self.resources.entry(*resource).or_default();
        if lock.blockers(client, mode).is_empty() {
            lock.grant(client, mode);
            true
        } else {
            false
        }
    }

    fn blockers(&self, client: u64, resource: &LockableResource, mode: LockMode) -> Vec<u64> {
        self.resources
            .get(resource)
            .map(|lock| lock.blockers(client, mode))
            .unwrap_or_default()
    }

    /// Whether waiting for `resource` would close a cycle in the wait-for graph
    fn would_deadlock(&self, client: u64, resource: &LockableResource, mode: LockMode) -> bool {
        let mut stack = self.blockers(client, resource, mode);
        let mut visited = HashSet::new();

        while let Some(holder) = stack.pop() {
            if holder == client {
                return true;
            }
            if !visited.insert(holder) {
                continue;
            }
            if let Some((waited_for, waited_mode)) = self.waiting.get(&holder) {
                stack.extend(self.blockers(holder, waited_for, *waited_mode));
            }
        }

        false
    }

    fn release_all(&mut self, client: u64) -> usize {
        let mut released = 0;
        self.resources.retain(|_, lock| {
            if lock.release_client(client) {
                released += 1;
            }
            !lock.is_free()
        });
        self.waiting.remove(&client);
        released
    }
}

#[derive(Default)]
struct LockStatsCollector {
    total_clients: AtomicU64,
    total_acquisitions: AtomicU64,
    contended_acquisitions: AtomicU64,
    deadlocks: AtomicU64,
    stopped_waits: AtomicU64,
    closed_clients: AtomicU64,
}

#[derive(Default)]
struct Shared {
    table: Mutex<LockTable>,
    /// Signalled whenever locks are released or a client is stopped
    changed: Notify,
    next_client_id: AtomicU64,
    stats: LockStatsCollector,
}

/// In-memory lock manager
#[derive(Clone, Default)]
pub struct MemoryLockManager {
    shared: Arc<Shared>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a new client with its concrete type
    pub fn client(&self) -> Arc<MemoryLockClient> {
        let id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared
            .stats
            .total_clients
            .fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryLockClient {
            id,
            shared: self.shared.clone(),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of resources currently locked by anyone
    pub fn locked_resources(&self) -> usize {
        self.shared.table.lock().resources.len()
    }

    /// Number of clients parked waiting for a lock
    pub fn waiting_clients(&self) -> usize {
        self.shared.table.lock().waiting.len()
    }

    pub fn is_locked(&self, resource: &LockableResource) -> bool {
        self.shared
            .table
            .lock()
            .resources
            .get(resource)
            .is_some_and(|lock| !lock.is_free())
    }

    pub fn stats(&self) -> LockStats {
        let stats = &self.shared.stats;
        LockStats {
            total_clients: stats.total_clients.load(Ordering::Relaxed),
            total_acquisitions: stats.total_acquisitions.load(Ordering::Relaxed),
            contended_acquisitions: stats.contended_acquisitions.load(Ordering::Relaxed),
            deadlocks: stats.deadlocks.load(Ordering::Relaxed),
            stopped_waits: stats.stopped_waits.load(Ordering::Relaxed),
            closed_clients: stats.closed_clients.load(Ordering::Relaxed),
        }
    }
}

impl LockManager for MemoryLockManager {
    fn new_client(&self) -> Arc<dyn LockClient> {
        self.client()
    }
}

/// Removes the client's wait-for edge however the acquisition ends,
/// including when the awaiting future is dropped
struct WaitRegistration<'a> {
    shared: &'a Shared,
    client: u64,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        self.shared.table.lock().waiting.remove(&self.client);
    }
}

/// Client of the in-memory lock manager
pub struct MemoryLockClient {
    id: u64,
    shared: Arc<Shared>,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLockClient {
    /// Number of resources this client holds a lock on
    pub fn held_locks(&self) -> usize {
        self.shared
            .table
            .lock()
            .resources
            .values()
            .filter(|lock| lock.is_held_by(self.id))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire(&self, resource: &LockableResource, mode: LockMode) -> Result<(), LockError> {
        if !resource.is_valid() {
            return Err(LockError::IllegalResource(format!(
                "{} is not a valid {} id",
                resource.id, resource.kind
            )));
        }

        let stats = &self.shared.stats;
        let _registration = WaitRegistration {
            shared: &self.shared,
            client: self.id,
        };
        let mut waited = false;

        loop {
            // Register interest before inspecting the table so a release
            // between the check and the await is not missed
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut table = self.shared.table.lock();

                if self.closed.load(Ordering::Acquire) {
                    return Err(LockError::Closed(self.id));
                }

                if self.stopped.load(Ordering::Acquire) {
                    if waited {
                        stats.stopped_waits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(LockError::Stopped(self.id));
                }

                if table.try_grant(self.id, resource, mode) {
                    stats.total_acquisitions.fetch_add(1, Ordering::Relaxed);
                    if waited {
                        stats.contended_acquisitions.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!(client = self.id, resource = %resource, mode = %mode, "Lock granted");
                    return Ok(());
                }

                if table.would_deadlock(self.id, resource, mode) {
                    let holders = table.blockers(self.id, resource, mode);
                    stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        client = self.id,
                        resource = %resource,
                        mode = %mode,
                        ?holders,
                        "Deadlock detected"
                    );
                    return Err(LockError::Deadlock(format!(
                        "client {} can not acquire {} lock on {} held by {:?} without a cycle",
                        self.id, mode, resource, holders
                    )));
                }

                table.waiting.insert(self.id, (*resource, mode));
            }

            waited = true;
            changed.await;
        }
    }
}

#[async_trait]
impl LockClient for MemoryLockClient {
    fn client_id(&self) -> u64 {
        self.id
    }

    async fn acquire_shared(&self, resource: &LockableResource) -> Result<(), LockError> {
        self.acquire(resource, LockMode::Shared).await
    }

    async fn acquire_exclusive(&self, resource: &LockableResource) -> Result<(), LockError> {
        self.acquire(resource, LockMode::Exclusive).await
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.shared.changed.notify_waiters();
        trace!(client = self.id, "Lock client stopped");
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let released = self.shared.table.lock().release_all(self.id);
        self.shared
            .stats
            .closed_clients
            .fetch_add(1, Ordering::Relaxed);
        self.shared.changed.notify_waiters();

        debug!(client = self.id, released, "Lock client closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_for_waiters(manager: &MemoryLockManager, count: usize) {
        for _ in 0..400 {
            if manager.waiting_clients() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} waiting clients", count);
    }

    #[tokio::test]
    async fn test_shared_locks_are_compatible() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();

        a.acquire_shared(&LockableResource::node(1)).await.unwrap();
        b.acquire_shared(&LockableResource::node(1)).await.unwrap();

        assert_eq!(a.held_locks(), 1);
        assert_eq!(b.held_locks(), 1);
        assert_eq!(manager.locked_resources(), 1);
    }

    #[tokio::test]
    async fn test_reentrant_and_upgrade() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let node = LockableResource::node(5);

        a.acquire_shared(&node).await.unwrap();
        // Sole shared holder may upgrade
        a.acquire_exclusive(&node).await.unwrap();
        a.acquire_exclusive(&node).await.unwrap();
        a.acquire_shared(&node).await.unwrap();

        assert_eq!(a.held_locks(), 1);
        a.close();
        assert!(!manager.is_locked(&node));
    }

    #[tokio::test]
    async fn test_exclusive_waits_until_holder_closes() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();
        let node = LockableResource::node(42);

        a.acquire_exclusive(&node).await.unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.acquire_exclusive(&node).await })
        };

        wait_for_waiters(&manager, 1).await;
        assert!(!waiter.is_finished());

        a.close();
        waiter.await.unwrap().unwrap();
        assert_eq!(b.held_locks(), 1);
        assert_eq!(manager.waiting_clients(), 0);
        assert_eq!(manager.stats().contended_acquisitions, 1);
    }

    #[tokio::test]
    async fn test_deadlock_is_detected_instead_of_waiting() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();
        let first = LockableResource::node(1);
        let second = LockableResource::node(2);

        a.acquire_exclusive(&first).await.unwrap();
        b.acquire_exclusive(&second).await.unwrap();

        let a_waits = {
            let a = a.clone();
            tokio::spawn(async move { a.acquire_exclusive(&second).await })
        };
        wait_for_waiters(&manager, 1).await;

        let result = b.acquire_exclusive(&first).await;
        assert!(matches!(result, Err(LockError::Deadlock(_))));
        assert_eq!(manager.stats().deadlocks, 1);

        // The victim backs off and A proceeds
        b.close();
        a_waits.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shared_holders_upgrading_deadlock() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();
        let node = LockableResource::node(9);

        a.acquire_shared(&node).await.unwrap();
        b.acquire_shared(&node).await.unwrap();

        let a_upgrade = {
            let a = a.clone();
            tokio::spawn(async move { a.acquire_exclusive(&node).await })
        };
        wait_for_waiters(&manager, 1).await;

        assert!(matches!(
            b.acquire_exclusive(&node).await,
            Err(LockError::Deadlock(_))
        ));

        b.close();
        a_upgrade.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_wait_but_keeps_held_locks() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();
        let contended = LockableResource::node(1);
        let owned = LockableResource::relationship(7);

        a.acquire_exclusive(&contended).await.unwrap();
        b.acquire_exclusive(&owned).await.unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.acquire_exclusive(&contended).await })
        };
        wait_for_waiters(&manager, 1).await;

        b.stop();
        assert_eq!(waiter.await.unwrap(), Err(LockError::Stopped(b.client_id())));
        assert!(manager.is_locked(&owned));
        assert_eq!(manager.waiting_clients(), 0);
        assert_eq!(manager.stats().stopped_waits, 1);

        b.close();
        assert!(!manager.is_locked(&owned));
    }

    #[tokio::test]
    async fn test_illegal_resource() {
        let manager = MemoryLockManager::new();
        let a = manager.client();

        let result = a.acquire_exclusive(&LockableResource::node(-3)).await;
        assert!(matches!(result, Err(LockError::IllegalResource(_))));
        assert_eq!(manager.locked_resources(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let manager = MemoryLockManager::new();
        let a = manager.client();

        a.acquire_exclusive(&LockableResource::schema()).await.unwrap();
        a.close();
        a.close();

        assert!(a.is_closed());
        assert_eq!(manager.stats().closed_clients, 1);
        assert_eq!(
            a.acquire_shared(&LockableResource::schema()).await,
            Err(LockError::Closed(a.client_id()))
        );
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_no_wait_edge() {
        let manager = MemoryLockManager::new();
        let a = manager.client();
        let b = manager.client();
        let node = LockableResource::node(3);

        a.acquire_exclusive(&node).await.unwrap();
        let result =
            tokio::time::timeout(Duration::from_millis(20), b.acquire_exclusive(&node)).await;
        assert!(result.is_err());
        assert_eq!(manager.waiting_clients(), 0);
    }
}
