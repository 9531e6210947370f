//! Background reclamation of unreachable peers.
//!
//! `PeerRef::drop` feeds object ids into a channel; the reaper thread drains
//! it with a bounded poll and hands each id to a callback that re-checks, under
//! the coordinator lock, that the peer really is unreachable before removing
//! the identity entry. The double check matters because a fresh lookup may
//! have handed out a new strong reference between the drop and the reap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::cache::types::ObjectId;

const REAP_POLL: Duration = Duration::from_millis(1_000);

pub(crate) struct Reaper {
    tx: Sender<ObjectId>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start the reaper thread. `reap` runs on the reaper thread for every
    /// drained id and must do its own reachability double check.
    pub fn start(reap: impl Fn(ObjectId) + Send + 'static) -> Self {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("faultline-reaper".into())
            .spawn(move || run_loop(rx, stop_flag, reap))
            .expect("failed to spawn reaper thread");
        Reaper {
            tx,
            stop,
            worker: Some(worker),
        }
    }

    /// Channel end handed to every `PeerRef` drop hook.
    pub fn queue(&self) -> Sender<ObjectId> {
        self.tx.clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    rx: Receiver<ObjectId>,
    stop: Arc<AtomicBool>,
    reap: impl Fn(ObjectId),
) {
    loop {
        if stop.load(Ordering::Acquire) {
            debug!("reaper stopping");
            return;
        }
        match rx.recv_timeout(REAP_POLL) {
            Ok(id) => reap(id),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
