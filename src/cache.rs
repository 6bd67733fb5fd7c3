use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, warn};

use crate::error::{CacheNotReady, RefreshError};
use crate::snapshot::FlagSnapshot;
use crate::store::FlagLoader;

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of offering a snapshot to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { generation: u64 },
    /// A snapshot of the same or a newer generation is already active; the offered one was dropped.
    Superseded { offered: u64, current: u64 },
}

/// What a successful `refresh_from_store` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub generation: u64,
    pub flag_count: usize,
    pub installed: bool,
    pub elapsed: Duration,
}

/// Owns the active [`FlagSnapshot`].
///
/// Reads go through a single atomically swapped pointer and never take a lock.
/// Writers build a complete snapshot off to the side and swap it in, so a reader sees
/// either the old generation or the new one, never a mix.
#[derive(Debug)]
pub struct CacheManager {
    current: ArcSwapOption<FlagSnapshot>,
    generations: AtomicU64,
    refresh_timeout: Duration,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_TIMEOUT)
    }
}

impl CacheManager {
    pub fn new(refresh_timeout: Duration) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            generations: AtomicU64::new(0),
            refresh_timeout,
        }
    }

    /// The latest installed snapshot, or `CacheNotReady` before the first load.
    pub fn current_snapshot(&self) -> Result<Arc<FlagSnapshot>, CacheNotReady> {
        self.current.load_full().ok_or(CacheNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Generation of the active snapshot, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current.load_full().map(|snapshot| snapshot.generation())
    }

    /// Reserves the next generation number.
    ///
    /// Generations are handed out when a load starts, so a load that started later
    /// always wins even if it finishes first.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Swaps in `snapshot` unless the active one is the same generation or newer.
    pub fn install_snapshot(&self, snapshot: FlagSnapshot) -> InstallOutcome {
        let offered = snapshot.generation();
        let new = Some(Arc::new(snapshot));
        let mut current = self.current.load();

        loop {
            if let Some(active) = &*current {
                if active.generation() >= offered {
                    return InstallOutcome::Superseded {
                        offered,
                        current: active.generation(),
                    };
                }
            }

            let previous = self.current.compare_and_swap(&current, new.clone());
            if same_snapshot(&previous, &current) {
                return InstallOutcome::Installed { generation: offered };
            }

            // Another writer got in between; re-check against what it installed.
            current = previous;
        }
    }

    /// Loads every active flag and installs the result as a new snapshot.
    ///
    /// On failure or timeout nothing is touched: the previous snapshot stays active.
    pub async fn refresh_from_store(&self, loader: &dyn FlagLoader) -> Result<RefreshOutcome, RefreshError> {
        let generation = self.next_generation();
        let started = Instant::now();

        let flags = match tokio::time::timeout(self.refresh_timeout, loader.load_active_flags()).await {
            Ok(Ok(flags)) => flags,
            Ok(Err(e)) => {
                warn!(generation, error = %e, "Flag load failed, keeping previous snapshot");
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    generation,
                    timeout_ms = self.refresh_timeout.as_millis() as u64,
                    "Flag load timed out, keeping previous snapshot"
                );
                return Err(RefreshError::Timeout(self.refresh_timeout));
            }
        };

        let snapshot = FlagSnapshot::build(generation, flags);
        let flag_count = snapshot.len();
        let elapsed = started.elapsed();

        let installed = match self.install_snapshot(snapshot) {
            InstallOutcome::Installed { .. } => {
                info!(
                    generation,
                    flags = flag_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flag cache refreshed"
                );
                true
            }
            InstallOutcome::Superseded { current, .. } => {
                debug!(generation, current, "Discarding superseded flag snapshot");
                false
            }
        };

        Ok(RefreshOutcome {
            generation,
            flag_count,
            installed,
            elapsed,
        })
    }
}

fn same_snapshot(a: &Option<Arc<FlagSnapshot>>, b: &Option<Arc<FlagSnapshot>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FlagDefinition;
    use crate::store::MemoryStore;

    #[test]
    fn test_not_ready_before_first_install() {
        let cache = CacheManager::default();
        assert_eq!(cache.current_snapshot().unwrap_err(), CacheNotReady);
        assert!(!cache.is_ready());
        assert_eq!(cache.generation(), None);
    }

    #[test]
    fn test_empty_snapshot_is_ready() {
        let cache = CacheManager::default();
        let generation = cache.next_generation();
        cache.install_snapshot(FlagSnapshot::build(generation, vec![]));

        let snapshot = cache.current_snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert!(cache.is_ready());
    }

    #[test]
    fn test_out_of_order_completion_keeps_newest_generation() {
        let cache = CacheManager::default();
        let older = cache.next_generation();
        let newer = cache.next_generation();

        let outcome = cache.install_snapshot(FlagSnapshot::build(newer, vec![FlagDefinition::new("new")]));
        assert_eq!(outcome, InstallOutcome::Installed { generation: newer });

        let outcome = cache.install_snapshot(FlagSnapshot::build(older, vec![FlagDefinition::new("old")]));
        assert_eq!(
            outcome,
            InstallOutcome::Superseded {
                offered: older,
                current: newer
            }
        );

        let snapshot = cache.current_snapshot().unwrap();
        assert_eq!(snapshot.generation(), newer);
        assert!(snapshot.contains("new"));
        assert!(!snapshot.contains("old"));
    }

    #[test]
    fn test_old_snapshot_stays_usable_after_swap() {
        let cache = CacheManager::default();
        cache.install_snapshot(FlagSnapshot::build(cache.next_generation(), vec![FlagDefinition::new("a")]));
        let held = cache.current_snapshot().unwrap();

        cache.install_snapshot(FlagSnapshot::build(cache.next_generation(), vec![FlagDefinition::new("b")]));

        assert!(held.contains("a"));
        assert!(!held.contains("b"));
        assert!(cache.current_snapshot().unwrap().contains("b"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let cache = CacheManager::default();
        let store = MemoryStore::new(vec![FlagDefinition::new("before").enabled(true)]);

        let outcome = cache.refresh_from_store(&store).await.unwrap();
        assert!(outcome.installed);
        assert_eq!(outcome.flag_count, 1);

        store.set_flags(vec![FlagDefinition::new("after").enabled(true)]);
        store.fail_next_loads(1);
        assert!(matches!(
            cache.refresh_from_store(&store).await,
            Err(RefreshError::Load(_))
        ));

        let snapshot = cache.current_snapshot().unwrap();
        assert!(snapshot.contains("before"));
        assert!(!snapshot.contains("after"));

        cache.refresh_from_store(&store).await.unwrap();
        let snapshot = cache.current_snapshot().unwrap();
        assert!(snapshot.contains("after"));
        assert!(!snapshot.contains("before"));
    }

    #[tokio::test]
    async fn test_failed_first_load_stays_not_ready() {
        let cache = CacheManager::default();
        let store = MemoryStore::new(vec![FlagDefinition::new("a")]);
        store.fail_next_loads(1);

        assert!(cache.refresh_from_store(&store).await.is_err());
        assert!(cache.current_snapshot().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_refresh_is_a_failure() {
        let cache = CacheManager::new(Duration::from_secs(2));
        let store = MemoryStore::new(vec![FlagDefinition::new("a")]);
        cache.refresh_from_store(&store).await.unwrap();

        store.set_load_delay(Some(Duration::from_secs(30)));
        store.set_flags(vec![FlagDefinition::new("b")]);

        assert!(matches!(
            cache.refresh_from_store(&store).await,
            Err(RefreshError::Timeout(_))
        ));
        assert!(cache.current_snapshot().unwrap().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_refreshes_resolve_by_generation() {
        let cache = Arc::new(CacheManager::default());
        let slow = Arc::new(MemoryStore::new(vec![FlagDefinition::new("slow")]));
        slow.set_load_delay(Some(Duration::from_secs(3)));
        let fast = Arc::new(MemoryStore::new(vec![FlagDefinition::new("fast")]));

        // slow starts first (lower generation) but finishes last
        let slow_refresh = {
            let cache = Arc::clone(&cache);
            let slow = Arc::clone(&slow);
            tokio::spawn(async move { cache.refresh_from_store(slow.as_ref()).await })
        };
        while slow.load_count() == 0 {
            tokio::task::yield_now().await;
        }
        let fast_outcome = cache.refresh_from_store(fast.as_ref()).await.unwrap();
        let slow_outcome = slow_refresh.await.unwrap().unwrap();

        assert!(fast_outcome.installed);
        assert!(!slow_outcome.installed);
        assert!(slow_outcome.generation < fast_outcome.generation);
        assert!(cache.current_snapshot().unwrap().contains("fast"));
    }

    #[test]
    fn test_readers_never_see_mixed_generations() {
        let cache = Arc::new(CacheManager::default());
        let flags_per_snapshot = 50;

        let build = |cache: &CacheManager| {
            let generation = cache.next_generation();
            let flags = (0..flags_per_snapshot)
                .map(|i| FlagDefinition::new(format!("flag-{}", i)).version(generation as i64));
            FlagSnapshot::build(generation, flags)
        };
        cache.install_snapshot(build(&cache));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = cache.current_snapshot().unwrap();
                        assert_eq!(snapshot.len(), flags_per_snapshot);
                        let expected = snapshot.generation() as i64;
                        assert!(snapshot.iter().all(|flag| flag.version == expected));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            cache.install_snapshot(build(&cache));
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
