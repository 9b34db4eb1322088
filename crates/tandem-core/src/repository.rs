// Timed repository
// Keyed store of lazily constructed values that are reaped once idle for longer than a timeout

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tandem_common::{Clock, ErrorCategory, duration_millis};
use tracing::{debug, warn};

/// Callback destroying a reaped value
pub type Reaper<K, V> = Arc<dyn Fn(&K, &V) -> anyhow::Result<()> + Send + Sync>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("concurrent access: {0}")]
    ConcurrentAccess(String),

    #[error("no such entry: {0}")]
    NoSuchEntry(String),
}

impl RepositoryError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Protocol
    }
}

/// Lifecycle state of a repository entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Constructed by `acquire` but not yet published with `begin`
    Reserved,
    /// Held by exactly one caller; never reaped
    InUse,
    /// Available for `acquire`; reaped once older than the timeout
    Idle,
}

struct TimedEntry<V> {
    value: Arc<V>,
    state: EntryState,
    touched_at: u64,
}

/// Result of `TimedRepository::acquire`
pub struct Acquired<V> {
    pub value: Arc<V>,
    /// Whether this call constructed the value
    pub created: bool,
}

/// TTL-bounded keyed store with exclusive creation
///
/// Each key maps to at most one live value. An entry is reaped by `sweep`
/// when it is not in use and has not been touched for `timeout`.
pub struct TimedRepository<K, V> {
    entries: DashMap<K, TimedEntry<V>>,
    reaper: Reaper<K, V>,
    timeout_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<K, V> TimedRepository<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<R>(timeout: Duration, clock: Arc<dyn Clock>, reaper: R) -> Self
    where
        R: Fn(&K, &V) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            reaper: Arc::new(reaper),
            timeout_ms: duration_millis(timeout),
            clock,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Return the value for `key`, constructing it if absent
    ///
    /// A constructed value stays `Reserved` until `begin`; an existing idle
    /// value is marked in use. Reserved or in-use entries are refused.
    /// `factory` runs while the key's shard is locked and must not touch
    /// this repository.
    pub fn acquire<F>(&self, key: &K, factory: F) -> Result<Acquired<V>, RepositoryError>
    where
        F: FnOnce() -> V,
    {
        let now = self.clock.now_millis();

        match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let value = Arc::new(factory());
                vacant.insert(TimedEntry {
                    value: value.clone(),
                    state: EntryState::Reserved,
                    touched_at: now,
                });
                Ok(Acquired {
                    value,
                    created: true,
                })
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match entry.state {
                    EntryState::Idle => {
                        entry.state = EntryState::InUse;
                        entry.touched_at = now;
                        Ok(Acquired {
                            value: entry.value.clone(),
                            created: false,
                        })
                    }
                    EntryState::Reserved => Err(RepositoryError::ConcurrentAccess(format!(
                        "{} is still being created",
                        key
                    ))),
                    EntryState::InUse => Err(RepositoryError::ConcurrentAccess(format!(
                        "{} is already in use",
                        key
                    ))),
                }
            }
        }
    }

    /// Publish a freshly constructed entry to the request that created it
    pub fn begin(&self, key: &K) -> Result<(), RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NoSuchEntry(key.to_string()))?;

        if entry.state != EntryState::Reserved {
            return Err(RepositoryError::ConcurrentAccess(format!(
                "{} has already begun",
                key
            )));
        }

        entry.state = EntryState::InUse;
        entry.touched_at = self.clock.now_millis();
        Ok(())
    }

    /// Mark the entry as no longer in use and refresh its timestamp
    pub fn release(&self, key: &K) -> Result<(), RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NoSuchEntry(key.to_string()))?;

        entry.state = EntryState::Idle;
        entry.touched_at = self.clock.now_millis();
        Ok(())
    }

    /// Remove the entry and hand its value to the caller, which now owns cleanup
    pub fn end(&self, key: &K) -> Result<Arc<V>, RepositoryError> {
        self.entries
            .remove(key)
            .map(|(_, entry)| entry.value)
            .ok_or_else(|| RepositoryError::NoSuchEntry(key.to_string()))
    }

    /// Peek at a value without changing its state or timestamp
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn state(&self, key: &K) -> Option<EntryState> {
        self.entries.get(key).map(|entry| entry.state)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &TimedEntry<V>, now: u64) -> bool {
        entry.state != EntryState::InUse && now.saturating_sub(entry.touched_at) >= self.timeout_ms
    }

    /// Destroy every expired entry and return how many were reaped
    ///
    /// Expired keys are snapshotted first; each one is then removed only if
    /// it is still expired, and its reaper runs without holding any shard.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();

        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in expired {
            let Some((key, entry)) = self
                .entries
                .remove_if(&key, |_, entry| self.is_expired(entry, now))
            else {
                continue;
            };

            reaped += 1;
            if let Err(e) = (self.reaper)(&key, &entry.value) {
                warn!(key = %key, error = %e, "Failed to reap expired entry");
            }
        }

        if reaped > 0 {
            debug!(count = reaped, "Reaped expired entries");
        }

        reaped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tandem_common::ManualClock;

    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn repository(
        clock: Arc<ManualClock>,
        reaped: Arc<AtomicUsize>,
    ) -> TimedRepository<String, String> {
        TimedRepository::new(TTL, clock, move |key: &String, _value: &String| {
            reaped.fetch_add(1, Ordering::SeqCst);
            if key.starts_with("broken") {
                anyhow::bail!("destructor failed for {}", key);
            }
            Ok(())
        })
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn test_second_acquire_before_begin_is_refused() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = repository(clock, Arc::new(AtomicUsize::new(0)));
        let factory_calls = AtomicUsize::new(0);
        let factory = || {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            "value".to_string()
        };

        let first = repo.acquire(&key("a"), factory).unwrap();
        assert!(first.created);
        assert_eq!(repo.state(&key("a")), Some(EntryState::Reserved));

        let second = repo.acquire(&key("a"), || "other".to_string());
        assert!(matches!(second, Err(RepositoryError::ConcurrentAccess(_))));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_acquire_after_begin_and_release_returns_same_value() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = repository(clock, Arc::new(AtomicUsize::new(0)));

        let first = repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();

        // Still in use by the creator
        assert!(matches!(
            repo.acquire(&key("a"), || "other".to_string()),
            Err(RepositoryError::ConcurrentAccess(_))
        ));

        repo.release(&key("a")).unwrap();
        let second = repo.acquire(&key("a"), || "other".to_string()).unwrap();
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.value, &second.value));
        assert_eq!(repo.state(&key("a")), Some(EntryState::InUse));
    }

    #[test]
    fn test_begin_twice_and_begin_absent() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = repository(clock, Arc::new(AtomicUsize::new(0)));

        assert!(matches!(
            repo.begin(&key("missing")),
            Err(RepositoryError::NoSuchEntry(_))
        ));

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();
        assert!(matches!(
            repo.begin(&key("a")),
            Err(RepositoryError::ConcurrentAccess(_))
        ));
    }

    #[test]
    fn test_sweep_respects_timeout_and_reaps_once() {
        let clock = Arc::new(ManualClock::new(1_000));
        let reaped = Arc::new(AtomicUsize::new(0));
        let repo = repository(clock.clone(), reaped.clone());

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();
        repo.release(&key("a")).unwrap();

        clock.advance(TTL - Duration::from_millis(1));
        assert_eq!(repo.sweep(), 0);
        assert_eq!(repo.len(), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(repo.sweep(), 1);
        assert!(repo.is_empty());
        assert_eq!(reaped.load(Ordering::SeqCst), 1);

        assert_eq!(repo.sweep(), 0);
        assert_eq!(reaped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_use_entries_are_never_reaped() {
        let clock = Arc::new(ManualClock::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        let repo = repository(clock.clone(), reaped.clone());

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();

        clock.advance(TTL * 100);
        assert_eq!(repo.sweep(), 0);
        assert_eq!(repo.state(&key("a")), Some(EntryState::InUse));
    }

    #[test]
    fn test_abandoned_reservation_is_reaped() {
        let clock = Arc::new(ManualClock::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        let repo = repository(clock.clone(), reaped.clone());

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        clock.advance(TTL);
        assert_eq!(repo.sweep(), 1);
        assert_eq!(reaped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_refreshes_timestamp() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = repository(clock.clone(), Arc::new(AtomicUsize::new(0)));

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();
        repo.release(&key("a")).unwrap();

        clock.advance(TTL - Duration::from_secs(1));
        repo.acquire(&key("a"), || unreachable!()).unwrap();
        repo.release(&key("a")).unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(repo.sweep(), 0);
    }

    #[test]
    fn test_end_removes_without_reaping() {
        let clock = Arc::new(ManualClock::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        let repo = repository(clock, reaped.clone());

        repo.acquire(&key("a"), || "value".to_string()).unwrap();
        repo.begin(&key("a")).unwrap();

        let value = repo.end(&key("a")).unwrap();
        assert_eq!(value.as_str(), "value");
        assert!(repo.get(&key("a")).is_none());
        assert_eq!(reaped.load(Ordering::SeqCst), 0);
        assert!(matches!(
            repo.end(&key("a")),
            Err(RepositoryError::NoSuchEntry(_))
        ));
        assert!(matches!(
            repo.release(&key("a")),
            Err(RepositoryError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn test_reaper_failure_does_not_abort_sweep() {
        let clock = Arc::new(ManualClock::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        let repo = repository(clock.clone(), reaped.clone());

        for name in ["broken-1", "healthy", "broken-2"] {
            repo.acquire(&key(name), || name.to_string()).unwrap();
            repo.begin(&key(name)).unwrap();
            repo.release(&key(name)).unwrap();
        }

        clock.advance(TTL);
        assert_eq!(repo.sweep(), 3);
        assert_eq!(reaped.load(Ordering::SeqCst), 3);
        assert!(repo.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_constructs_once() {
        let clock = Arc::new(ManualClock::new(0));
        let repo = repository(clock, Arc::new(AtomicUsize::new(0)));
        let factory_calls = AtomicUsize::new(0);
        let created = AtomicUsize::new(0);
        let refused = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let result = repo.acquire(&key("shared"), || {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        "value".to_string()
                    });
                    match result {
                        Ok(acquired) if acquired.created => {
                            created.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(_) => {}
                        Err(RepositoryError::ConcurrentAccess(_)) => {
                            refused.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                });
            }
        });

        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(refused.load(Ordering::SeqCst), 7);
    }
}
