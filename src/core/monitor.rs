//! Purpose: Background worker turning handle disposal notifications into evictions.
//! Role: Sole consumer of `release()` signals; keeps eviction off caller threads.
//! Invariants: Notifications are processed in arrival order; duplicates are harmless
//! because eviction is idempotent.
//! Invariants: Eviction failures are logged, never raised; they must not stop the loop.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::core::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::HandleCore;
use crate::core::store::StoreShared;

pub(crate) enum Disposal {
    Evict(Arc<HandleCore>),
    Shutdown,
}

pub(crate) struct ReachabilityMonitor {
    disposals: Sender<Disposal>,
    worker: Option<JoinHandle<()>>,
}

impl ReachabilityMonitor {
    pub(crate) fn start<C>(shared: Arc<StoreShared<C>>) -> Result<Self, Error>
    where
        C: Codec + Send + Sync + 'static,
    {
        let (disposals, queue) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("spillway-monitor".to_string())
            .spawn(move || run(shared, queue))
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to start reachability monitor")
                    .with_source(err)
            })?;
        Ok(Self {
            disposals,
            worker: Some(worker),
        })
    }

    pub(crate) fn sender(&self) -> Sender<Disposal> {
        self.disposals.clone()
    }

    /// Cooperative stop: notifications queued before the shutdown marker are
    /// drained first, and an in-progress eviction always completes.
    pub(crate) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.disposals.send(Disposal::Shutdown);
        if worker.join().is_err() {
            tracing::error!("reachability monitor worker panicked");
        }
    }
}

fn run<C>(shared: Arc<StoreShared<C>>, queue: Receiver<Disposal>)
where
    C: Codec + Send + Sync + 'static,
{
    // The loop also ends when every sender is gone, covering stores that
    // are dropped without an explicit close.
    for disposal in queue {
        match disposal {
            Disposal::Evict(core) => {
                if let Err(err) = shared.evict_core(&core) {
                    tracing::warn!(handle = core.id(), error = %err, "eviction failed");
                }
            }
            Disposal::Shutdown => break,
        }
    }
}
