// Swap store: backing-file ownership, first-fit spill, rehydration, reclamation.
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::alloc::{AllocationTable, Region};
use crate::core::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::{HandleCore, SwapHandle};
use crate::core::monitor::ReachabilityMonitor;

/// Disk-backed swap cache over one anonymous temporary file.
///
/// The file is unlinked at creation, so its space is reclaimed on every
/// exit path, including abnormal process termination. Mutating operations
/// (`spill`, `reserialize`, `evict`) run under one exclusive section that
/// also guards truncation; fetches share a read lock, so a fetch already
/// holding it always observes pre-eviction bytes.
pub struct SwapStore<C: Codec> {
    shared: Arc<StoreShared<C>>,
    monitor: ReachabilityMonitor,
}

pub(crate) struct StoreShared<C: Codec> {
    codec: C,
    inner: RwLock<StoreInner>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

struct StoreInner {
    file: File,
    table: AllocationTable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreStats {
    pub live_entries: usize,
    pub live_bytes: u64,
    pub file_len: u64,
}

impl<C: Codec> SwapStore<C> {
    /// Creates the backing file and starts the reachability monitor.
    pub fn open(codec: C) -> Result<Self, Error>
    where
        C: Send + Sync + 'static,
    {
        let file = tempfile::tempfile().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create backing file")
                .with_source(err)
        })?;
        let shared = Arc::new(StoreShared {
            codec,
            inner: RwLock::new(StoreInner {
                file,
                table: AllocationTable::new(),
            }),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        let monitor = ReachabilityMonitor::start(Arc::clone(&shared))?;
        Ok(Self { shared, monitor })
    }

    /// Encodes `value`, allocates a region first-fit, writes it, and
    /// returns a live handle that owns the in-memory copy. No handle or
    /// table entry exists after a failed encode or write.
    pub fn spill(&self, value: C::Value) -> Result<SwapHandle<C>, Error> {
        self.shared.ensure_open()?;
        let bytes = self.shared.encode(&value)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let length = bytes.len() as u64;

        let region = {
            let mut inner = self.shared.write_inner()?;
            let offset = inner.table.place(length);
            let region = Region::new(offset, length);
            if let Err(err) = write_all_at(&inner.file, &bytes, offset) {
                // A partial write may have grown the file past the last
                // live entry; shrink back so the length invariant holds.
                let end = inner.table.end();
                let _ = inner.file.set_len(end);
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to write spilled value")
                    .with_offset(offset)
                    .with_length(length)
                    .with_source(err));
            }
            inner.table.insert(id, region);
            region
        };

        tracing::debug!(
            handle = id,
            offset = region.offset,
            length = region.length,
            "spilled value"
        );
        Ok(SwapHandle::new(
            Arc::new(HandleCore::new(id, region)),
            Arc::new(value),
            Arc::clone(&self.shared),
            self.monitor.sender(),
        ))
    }

    /// Reads and decodes the handle's region without touching its cache.
    pub fn fetch(&self, handle: &SwapHandle<C>) -> Result<C::Value, Error> {
        self.shared.fetch_core(handle.core())
    }

    /// Re-encodes `value` into a fresh first-fit region and replaces the
    /// handle's cached copy. Equivalent to `handle.update(value)`.
    pub fn reserialize(&self, handle: &SwapHandle<C>, value: C::Value) -> Result<(), Error> {
        handle.update(value)
    }

    /// Idempotent: evicting an already-dead handle is a no-op.
    pub fn evict(&self, handle: &SwapHandle<C>) -> Result<(), Error> {
        self.shared.evict_core(handle.core())
    }

    pub fn stats(&self) -> Result<StoreStats, Error> {
        let inner = self.shared.read_inner()?;
        let file_len = inner.file.metadata().map_err(io_error)?.len();
        Ok(StoreStats {
            live_entries: inner.table.len(),
            live_bytes: inner.table.live_bytes(),
            file_len,
        })
    }

    /// Stops the monitor (draining queued disposal notifications), then
    /// marks the store closed. The backing file is released once the last
    /// holder of the store internals is gone.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        self.monitor.shutdown();
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn truncate_for_tests(&self, len: u64) {
        let inner = self.shared.write_inner().expect("lock");
        inner.file.set_len(len).expect("truncate");
    }
}

impl<C: Codec> Drop for SwapStore<C> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl<C: Codec> StoreShared<C> {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Closed).with_message("store is closed"));
        }
        Ok(())
    }

    fn encode(&self, value: &C::Value) -> Result<Vec<u8>, Error> {
        self.codec.encode(value).map_err(|err| {
            Error::new(ErrorKind::Encode)
                .with_message("codec failed to encode value")
                .with_source(err)
        })
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, StoreInner>, Error> {
        self.inner
            .read()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("store lock poisoned"))
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, StoreInner>, Error> {
        self.inner
            .write()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("store lock poisoned"))
    }

    pub(crate) fn fetch_core(&self, core: &HandleCore) -> Result<C::Value, Error> {
        self.ensure_open()?;
        let bytes = {
            let inner = self.read_inner()?;
            let region = core.live_region()?.ok_or_else(|| {
                Error::new(ErrorKind::NotFound).with_message("handle was evicted")
            })?;
            let mut bytes = vec![0u8; region.length as usize];
            read_exact_at(&inner.file, &mut bytes, region.offset).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    Error::new(ErrorKind::Corrupt)
                        .with_message("short read from backing file")
                        .with_offset(region.offset)
                        .with_length(region.length)
                } else {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to read spilled value")
                        .with_offset(region.offset)
                        .with_length(region.length)
                        .with_source(err)
                }
            })?;
            bytes
        };
        tracing::trace!(handle = core.id(), "fetched value");
        self.codec.decode(&bytes).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("codec failed to decode value")
                .with_source(err)
        })
    }

    /// Places the new bytes over the table with the handle's own entry
    /// excluded (its gap is reusable), then swaps the entry and region.
    /// On any failure the handle's prior region stays intact.
    pub(crate) fn reserialize_core(&self, core: &HandleCore, value: &C::Value) -> Result<(), Error> {
        self.ensure_open()?;
        let bytes = self.encode(value)?;
        let length = bytes.len() as u64;

        let mut inner = self.write_inner()?;
        let old = core
            .live_region()?
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("handle was evicted"))?;
        let offset = inner.table.place_excluding(Some(core.id()), length);
        let region = Region::new(offset, length);

        // When the replacement reuses the old gap a failed write would
        // clobber the prior bytes, so snapshot them for rollback.
        let snapshot = if region.overlaps(&old) {
            let mut prior = vec![0u8; old.length as usize];
            read_exact_at(&inner.file, &mut prior, old.offset).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to snapshot prior region")
                    .with_offset(old.offset)
                    .with_length(old.length)
                    .with_source(err)
            })?;
            Some(prior)
        } else {
            None
        };

        if let Err(err) = write_all_at(&inner.file, &bytes, offset) {
            if let Some(prior) = snapshot {
                let _ = write_all_at(&inner.file, &prior, old.offset);
            }
            let end = inner.table.end();
            let _ = inner.file.set_len(end);
            return Err(Error::new(ErrorKind::Io)
                .with_message("failed to write reserialized value")
                .with_offset(offset)
                .with_length(length)
                .with_source(err));
        }

        let prior_end = inner.table.end();
        inner.table.remove(core.id());
        inner.table.insert(core.id(), region);
        core.set_region(region)?;
        let end = inner.table.end();
        if end < prior_end {
            if let Err(err) = inner.file.set_len(end) {
                tracing::warn!(handle = core.id(), error = %err, "post-reserialize truncate failed");
            }
        }
        tracing::debug!(
            handle = core.id(),
            offset = region.offset,
            length = region.length,
            "reserialized value"
        );
        Ok(())
    }

    /// Removes the handle's entry and truncates the file when that entry
    /// held the maximum end offset. Interior gaps stay on disk for reuse.
    pub(crate) fn evict_core(&self, core: &HandleCore) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.write_inner()?;
        if core.kill()?.is_none() {
            return Ok(());
        }
        let prior_end = inner.table.end();
        inner.table.remove(core.id());
        let end = inner.table.end();
        if end < prior_end {
            inner.file.set_len(end).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to truncate backing file")
                    .with_length(end)
                    .with_source(err)
            })?;
        }
        tracing::debug!(handle = core.id(), "evicted value");
        Ok(())
    }
}

fn io_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io).with_source(err)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let read = file.seek_read(buf, offset)?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let rest = buf;
        buf = &mut rest[read..];
        offset += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}
