//! Replica conversations
//!
//! A conversation binds one replica session, identified by its
//! `RequestContext`, to exactly one lock client. The manager keeps them in a
//! `TimedRepository` so that a replica which disappears without ending its
//! session has its locks released once the conversation has been idle for
//! longer than the lock read timeout plus a margin.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tandem_common::{Clock, ErrorCategory, RequestContext};
use tandem_lock::{LockClient, LockManager};
use tracing::{debug, info};

use crate::repository::{RepositoryError, TimedRepository};
use crate::scheduler::{JobHandle, JobScheduler};
use crate::settings::HaSettings;

/// Counter of conversations closed by the idle sweep
pub const CONVERSATIONS_REAPED_TOTAL: &str = "conversations_reaped_total";

/// Gauge of live conversations, published after every sweep
pub const CONVERSATIONS_ACTIVE: &str = "conversations_active";

type ConversationRepository = TimedRepository<RequestContext, Conversation>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("conversation manager is not running")]
    NotRunning,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ConversationError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Protocol
    }

    pub fn is_no_such_entry(&self) -> bool {
        matches!(
            self,
            ConversationError::Repository(RepositoryError::NoSuchEntry(_))
        )
    }
}

/// Source of lock clients for new conversations
pub trait ConversationSpi: Send + Sync {
    fn acquire_client(&self) -> Arc<dyn LockClient>;
}

/// Hands out clients from a lock manager
pub struct DefaultConversationSpi {
    lock_manager: Arc<dyn LockManager>,
}

impl DefaultConversationSpi {
    pub fn new(lock_manager: Arc<dyn LockManager>) -> Self {
        Self { lock_manager }
    }
}

impl ConversationSpi for DefaultConversationSpi {
    fn acquire_client(&self) -> Arc<dyn LockClient> {
        self.lock_manager.new_client()
    }
}

/// One replica session and the lock client it owns
pub struct Conversation {
    client: Mutex<Option<Arc<dyn LockClient>>>,
    active: AtomicBool,
}

impl Conversation {
    pub fn new(client: Arc<dyn LockClient>) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            active: AtomicBool::new(true),
        }
    }

    /// The lock client, or `None` once the conversation is closed
    pub fn locks(&self) -> Option<Arc<dyn LockClient>> {
        self.client.lock().clone()
    }

    /// Close the lock client, releasing every lock it holds. Idempotent.
    pub fn close(&self) {
        let mut client = self.client.lock();
        if let Some(client) = client.take() {
            client.close();
            self.active.store(false, Ordering::Release);
        }
    }

    /// Abort waiting acquisitions; held locks stay until `close`
    pub fn stop(&self) {
        if let Some(client) = self.client.lock().as_ref() {
            client.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let client_id = self.client.lock().as_ref().map(|client| client.client_id());
        f.debug_struct("Conversation")
            .field("client_id", &client_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A conversation held in use; released back to idle on drop
pub struct ConversationLease {
    repository: Arc<ConversationRepository>,
    context: RequestContext,
    conversation: Arc<Conversation>,
}

impl ConversationLease {
    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

impl Deref for ConversationLease {
    type Target = Conversation;

    fn deref(&self) -> &Conversation {
        &self.conversation
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        // The conversation may have been ended meanwhile
        if self.repository.release(&self.context).is_err() {
            debug!(context = %self.context, "Conversation ended before lease was released");
        }
    }
}

/// Tracks the conversation of every connected replica session
pub struct ConversationManager {
    spi: Arc<dyn ConversationSpi>,
    scheduler: Arc<dyn JobScheduler>,
    settings: HaSettings,
    clock: Arc<dyn Clock>,
    conversations: RwLock<Option<Arc<ConversationRepository>>>,
    sweep_job: Mutex<Option<JobHandle>>,
}

impl ConversationManager {
    pub fn new(
        spi: Arc<dyn ConversationSpi>,
        scheduler: Arc<dyn JobScheduler>,
        settings: HaSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            spi,
            scheduler,
            settings,
            clock,
            conversations: RwLock::new(None),
            sweep_job: Mutex::new(None),
        }
    }

    /// Create the conversation store and schedule the idle sweep
    pub fn start(&self) {
        let mut conversations = self.conversations.write();
        if conversations.is_some() {
            return;
        }

        let timeout = self.settings.conversation_timeout();
        let repository = Arc::new(TimedRepository::new(
            timeout,
            self.clock.clone(),
            |context: &RequestContext, conversation: &Conversation| {
                debug!(context = %context, "Closing idle conversation");
                conversation.close();
                counter!(CONVERSATIONS_REAPED_TOTAL).increment(1);
                Ok(())
            },
        ));

        let swept = repository.clone();
        let job = self.scheduler.schedule_recurring(
            "conversation-sweep",
            self.settings.conversation_sweep_interval(),
            Box::new(move || {
                let repository = swept.clone();
                async move {
                    sweep_repository(&repository);
                }
                .boxed()
            }),
        );

        *conversations = Some(repository);
        *self.sweep_job.lock() = Some(job);

        info!(
            timeout_ms = timeout.as_millis() as u64,
            "Conversation manager started"
        );
    }

    /// Cancel the sweep and close every live conversation
    pub fn stop(&self) {
        if let Some(job) = self.sweep_job.lock().take() {
            job.cancel();
        }

        let Some(repository) = self.conversations.write().take() else {
            return;
        };

        let mut closed = 0;
        for context in repository.keys() {
            if let Ok(conversation) = repository.end(&context) {
                conversation.close();
                closed += 1;
            }
        }

        info!(closed, "Conversation manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.conversations.read().is_some()
    }

    fn repository(&self) -> Result<Arc<ConversationRepository>, ConversationError> {
        self.conversations
            .read()
            .clone()
            .ok_or(ConversationError::NotRunning)
    }

    fn create(&self) -> Conversation {
        Conversation::new(self.spi.acquire_client())
    }

    /// Create and publish a new conversation for `context`
    pub fn begin(&self, context: &RequestContext) -> Result<Arc<Conversation>, ConversationError> {
        let repository = self.repository()?;
        let acquired = repository.acquire(context, || self.create())?;

        if !acquired.created {
            repository.release(context)?;
            return Err(RepositoryError::ConcurrentAccess(format!(
                "{} already has a conversation",
                context
            ))
            .into());
        }

        repository.begin(context)?;
        debug!(context = %context, "Began conversation");
        Ok(acquired.value)
    }

    /// Mark the conversation for `context` in use, creating it if absent
    pub fn acquire(
        &self,
        context: &RequestContext,
    ) -> Result<Arc<Conversation>, ConversationError> {
        let repository = self.repository()?;
        let acquired = repository.acquire(context, || self.create())?;
        if acquired.created {
            repository.begin(context)?;
        }
        Ok(acquired.value)
    }

    /// Like `acquire`, releasing the conversation when the lease is dropped
    pub fn acquire_guarded(
        &self,
        context: &RequestContext,
    ) -> Result<ConversationLease, ConversationError> {
        let repository = self.repository()?;
        let conversation = self.acquire(context)?;
        Ok(ConversationLease {
            repository,
            context: context.clone(),
            conversation,
        })
    }

    pub fn release(&self, context: &RequestContext) -> Result<(), ConversationError> {
        Ok(self.repository()?.release(context)?)
    }

    /// Remove the conversation for `context` and close its lock client
    pub fn end(&self, context: &RequestContext) -> Result<(), ConversationError> {
        let conversation = self.repository()?.end(context)?;
        conversation.close();
        debug!(context = %context, "Ended conversation");
        Ok(())
    }

    /// Abort the waiting lock acquisitions of the conversation for `context`
    pub fn stop_conversation(&self, context: &RequestContext) -> Result<(), ConversationError> {
        let conversation = self
            .repository()?
            .get(context)
            .ok_or_else(|| RepositoryError::NoSuchEntry(context.to_string()))?;
        conversation.stop();
        Ok(())
    }

    /// Contexts that currently have a conversation
    pub fn active_contexts(&self) -> Vec<RequestContext> {
        self.conversations
            .read()
            .as_ref()
            .map(|repository| repository.keys())
            .unwrap_or_default()
    }

    /// Close every conversation idle for longer than the timeout
    pub fn sweep(&self) -> Result<usize, ConversationError> {
        let repository = self.repository()?;
        Ok(sweep_repository(&repository))
    }
}

fn sweep_repository(repository: &ConversationRepository) -> usize {
    let reaped = repository.sweep();
    gauge!(CONVERSATIONS_ACTIVE).set(repository.len() as f64);
    reaped
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_common::{Epoch, ManualClock};
    use tandem_lock::{LockableResource, MemoryLockManager};

    use super::*;
    use crate::scheduler::TokioJobScheduler;

    fn context(machine_id: i32, event_identifier: i32) -> RequestContext {
        RequestContext::new(Epoch::new(1, 1_000), machine_id, event_identifier)
    }

    fn manager(locks: &MemoryLockManager, clock: Arc<ManualClock>) -> ConversationManager {
        let settings = HaSettings {
            lock_read_timeout_ms: 1_000,
            conversation_sweep_interval_ms: 3_600_000,
            ..Default::default()
        };
        let manager = ConversationManager::new(
            Arc::new(DefaultConversationSpi::new(Arc::new(locks.clone()))),
            Arc::new(TokioJobScheduler),
            settings,
            clock,
        );
        manager.start();
        manager
    }

    #[tokio::test]
    async fn test_conversation_close_releases_locks_once() {
        let locks = MemoryLockManager::new();
        let conversation = Conversation::new(locks.new_client());
        let client = conversation.locks().unwrap();
        client
            .acquire_exclusive(&LockableResource::node(1))
            .await
            .unwrap();
        assert!(locks.is_locked(&LockableResource::node(1)));

        conversation.close();
        conversation.close();
        assert!(!conversation.is_active());
        assert!(conversation.locks().is_none());
        assert!(!locks.is_locked(&LockableResource::node(1)));
        assert_eq!(locks.stats().closed_clients, 1);

        // Stop after close is a no-op
        conversation.stop();
    }

    #[tokio::test]
    async fn test_concurrent_close_and_stop_close_client_once() {
        let locks = MemoryLockManager::new();
        let conversation = Conversation::new(locks.new_client());
        conversation
            .locks()
            .unwrap()
            .acquire_exclusive(&LockableResource::node(1))
            .await
            .unwrap();

        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|scope| {
            for i in 0..8 {
                let conversation = &conversation;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        conversation.close();
                    } else {
                        conversation.stop();
                    }
                });
            }
        });

        assert!(!conversation.is_active());
        assert!(!locks.is_locked(&LockableResource::node(1)));
        assert_eq!(locks.stats().closed_clients, 1);
    }

    #[tokio::test]
    async fn test_begin_twice_is_concurrent_access() {
        let locks = MemoryLockManager::new();
        let manager = manager(&locks, Arc::new(ManualClock::new(0)));
        let ctx = context(1, 1);

        manager.begin(&ctx).unwrap();
        let err = manager.begin(&ctx).unwrap_err();
        assert!(matches!(
            err,
            ConversationError::Repository(RepositoryError::ConcurrentAccess(_))
        ));

        // Still refused once idle
        manager.release(&ctx).unwrap();
        assert!(manager.begin(&ctx).is_err());
        assert_eq!(manager.active_contexts(), vec![ctx]);
    }

    #[tokio::test]
    async fn test_acquire_creates_lazily_and_lease_releases() {
        let locks = MemoryLockManager::new();
        let manager = manager(&locks, Arc::new(ManualClock::new(0)));
        let ctx = context(2, 1);

        {
            let lease = manager.acquire_guarded(&ctx).unwrap();
            assert!(lease.is_active());
            assert_eq!(lease.context(), &ctx);
            assert!(manager.acquire(&ctx).is_err());
        }

        let again = manager.acquire(&ctx).unwrap();
        assert!(again.is_active());
        manager.release(&ctx).unwrap();
    }

    #[tokio::test]
    async fn test_end_closes_and_removes() {
        let locks = MemoryLockManager::new();
        let manager = manager(&locks, Arc::new(ManualClock::new(0)));
        let ctx = context(3, 1);

        let conversation = manager.begin(&ctx).unwrap();
        manager.end(&ctx).unwrap();
        assert!(!conversation.is_active());
        assert!(manager.active_contexts().is_empty());
        assert!(manager.end(&ctx).unwrap_err().is_no_such_entry());
    }

    #[tokio::test]
    async fn test_operations_fail_after_stop() {
        let locks = MemoryLockManager::new();
        let manager = manager(&locks, Arc::new(ManualClock::new(0)));
        assert!(manager.is_running());

        manager.stop();
        assert!(!manager.is_running());
        assert_eq!(
            manager.begin(&context(4, 1)).unwrap_err(),
            ConversationError::NotRunning
        );
        assert_eq!(manager.sweep().unwrap_err(), ConversationError::NotRunning);
        assert!(manager.active_contexts().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_conversations_after_timeout() {
        let locks = MemoryLockManager::new();
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager(&locks, clock.clone());
        let ctx = context(5, 1);

        let conversation = manager.begin(&ctx).unwrap();
        manager.release(&ctx).unwrap();

        clock.advance(Duration::from_millis(5_999));
        assert_eq!(manager.sweep().unwrap(), 0);
        assert!(conversation.is_active());

        clock.advance(Duration::from_millis(1));
        assert_eq!(manager.sweep().unwrap(), 1);
        assert!(!conversation.is_active());
        assert!(manager.active_contexts().is_empty());
    }
}
