// Per-value handle: cached decoded copy, region tracking, and release signaling.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::alloc::Region;
use crate::core::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::monitor::Disposal;
use crate::core::store::StoreShared;

/// Region bookkeeping shared between a handle and the store. Mutated only
/// while the store's exclusive section is held; the inner mutex exists so
/// the monitor can reach the state without a live `SwapHandle`.
pub(crate) struct HandleCore {
    id: u64,
    state: Mutex<RegionState>,
    released: AtomicBool,
}

struct RegionState {
    region: Region,
    live: bool,
}

impl HandleCore {
    pub(crate) fn new(id: u64, region: Region) -> Self {
        Self {
            id,
            state: Mutex::new(RegionState { region, live: true }),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RegionState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("handle state lock poisoned"))
    }

    /// Current region, or `None` once the handle has been evicted.
    pub(crate) fn live_region(&self) -> Result<Option<Region>, Error> {
        let state = self.lock_state()?;
        Ok(state.live.then_some(state.region))
    }

    pub(crate) fn set_region(&self, region: Region) -> Result<(), Error> {
        let mut state = self.lock_state()?;
        state.region = region;
        Ok(())
    }

    /// Marks the handle dead, returning its region if it was still live.
    pub(crate) fn kill(&self) -> Result<Option<Region>, Error> {
        let mut state = self.lock_state()?;
        if !state.live {
            return Ok(None);
        }
        state.live = false;
        Ok(Some(state.region))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.lock_state().map(|state| state.live).unwrap_or(false)
    }

    /// Returns the previous released flag; only the first caller proceeds.
    pub(crate) fn mark_released(&self) -> bool {
        self.released.swap(true, Ordering::SeqCst)
    }
}

/// Caller-visible token for one spilled value.
///
/// `get` serves the cached decoded copy when present and otherwise fetches
/// from the store; the cache lock is held across that fetch, so concurrent
/// `get`s on one handle share a single read instead of issuing duplicates.
/// Dropping the handle releases it.
pub struct SwapHandle<C: Codec> {
    core: Arc<HandleCore>,
    cache: Mutex<Option<Arc<C::Value>>>,
    store: Arc<StoreShared<C>>,
    disposals: Sender<Disposal>,
}

impl<C: Codec> std::fmt::Debug for SwapHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapHandle")
            .field("id", &self.core.id())
            .field("live", &self.is_live())
            .finish()
    }
}

impl<C: Codec> SwapHandle<C> {
    pub(crate) fn new(
        core: Arc<HandleCore>,
        value: Arc<C::Value>,
        store: Arc<StoreShared<C>>,
        disposals: Sender<Disposal>,
    ) -> Self {
        Self {
            core,
            cache: Mutex::new(Some(value)),
            store,
            disposals,
        }
    }

    pub(crate) fn core(&self) -> &Arc<HandleCore> {
        &self.core
    }

    pub fn is_live(&self) -> bool {
        self.core.is_live()
    }

    /// Cached value, or a single-flight fetch from the store.
    pub fn get(&self) -> Result<Arc<C::Value>, Error> {
        let mut slot = self.lock_cache()?;
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(self.store.fetch_core(&self.core)?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Replaces the value on disk and in cache. On failure the prior cached
    /// value and region stay authoritative.
    pub fn update(&self, value: C::Value) -> Result<(), Error> {
        let mut slot = self.lock_cache()?;
        self.store.reserialize_core(&self.core, &value)?;
        *slot = Some(Arc::new(value));
        Ok(())
    }

    /// Drops the cached decoded copy; the next `get` fetches from disk.
    pub fn shed_cache(&self) -> Result<(), Error> {
        let mut slot = self.lock_cache()?;
        *slot = None;
        Ok(())
    }

    /// Signals that the value is no longer needed. Fire-and-forget and
    /// idempotent; eviction happens on the monitor thread.
    pub fn release(&self) {
        if self.core.mark_released() {
            return;
        }
        // Send failure means the store already shut its monitor down and
        // the backing file is gone with it.
        let _ = self.disposals.send(Disposal::Evict(Arc::clone(&self.core)));
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, Option<Arc<C::Value>>>, Error> {
        self.cache
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("handle cache lock poisoned"))
    }
}

impl<C: Codec> Drop for SwapHandle<C> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::core::codec::{Codec, CodecError};
    use crate::core::store::SwapStore;

    /// Identity codec that counts decode calls. Clones share the counter.
    #[derive(Clone, Default)]
    struct CountingCodec {
        decodes: Arc<AtomicUsize>,
    }

    impl Codec for CountingCodec {
        type Value = Vec<u8>;

        fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
            Ok(value.clone())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            Ok(bytes.to_vec())
        }
    }

    fn wait_for_eviction(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("eviction did not happen in time");
    }

    #[test]
    fn spill_populates_the_cache() {
        let codec = CountingCodec::default();
        let decodes = Arc::clone(&codec.decodes);
        let store = SwapStore::open(codec).expect("open");
        let handle = store.spill(vec![1, 2, 3]).expect("spill");
        assert_eq!(handle.get().expect("get").as_ref(), &vec![1, 2, 3]);
        assert_eq!(decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn get_fetches_once_after_shedding() {
        let codec = CountingCodec::default();
        let decodes = Arc::clone(&codec.decodes);
        let store = SwapStore::open(codec).expect("open");
        let handle = store.spill(vec![4, 5, 6]).expect("spill");
        handle.shed_cache().expect("shed");

        assert_eq!(handle.get().expect("get").as_ref(), &vec![4, 5, 6]);
        assert_eq!(handle.get().expect("get").as_ref(), &vec![4, 5, 6]);
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_gets_share_one_fetch() {
        let codec = CountingCodec::default();
        let decodes = Arc::clone(&codec.decodes);
        let store = SwapStore::open(codec).expect("open");
        let handle = store.spill(vec![7; 32]).expect("spill");
        handle.shed_cache().expect("shed");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let value = handle.get().expect("get");
                    assert_eq!(value.as_ref(), &vec![7; 32]);
                });
            }
        });
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_replaces_cache_and_disk() {
        let codec = CountingCodec::default();
        let store = SwapStore::open(codec).expect("open");
        let handle = store.spill(vec![1; 4]).expect("spill");

        handle.update(vec![2; 4]).expect("update");
        assert_eq!(handle.get().expect("get").as_ref(), &vec![2; 4]);
        assert_eq!(store.fetch(&handle).expect("fetch"), vec![2; 4]);
    }

    #[test]
    fn release_is_processed_by_the_monitor() {
        let store = SwapStore::open(CountingCodec::default()).expect("open");
        let handle = store.spill(vec![3; 8]).expect("spill");

        handle.release();
        handle.release();
        wait_for_eviction(|| !handle.is_live());
        let stats = store.stats().expect("stats");
        assert_eq!(stats.live_entries, 0);
        assert_eq!(stats.file_len, 0);
    }

    #[test]
    fn dropping_the_handle_releases_it() {
        let store = SwapStore::open(CountingCodec::default()).expect("open");
        let handle = store.spill(vec![9; 8]).expect("spill");
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = store.stats().expect("stats");
            if stats.live_entries == 0 && stats.file_len == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "drop-driven eviction timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn close_drains_pending_releases() {
        let store = SwapStore::open(CountingCodec::default()).expect("open");
        let handles: Vec<_> = (0..16)
            .map(|byte| store.spill(vec![byte as u8; 8]).expect("spill"))
            .collect();
        for handle in &handles {
            handle.release();
        }
        store.close();
        for handle in &handles {
            assert!(!handle.is_live());
        }
    }
}
