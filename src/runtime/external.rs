//! The cross-thread external-job inbox.
//!
//! Foreign threads may not touch ivars or queues; the only way work
//! enters the kernel from outside is this inbox. Deposited thunks are
//! spliced into the end of the normal band once per cycle, and each
//! deposit raises a wakeup signal a blocked driver can sleep on.
//!
//! This is the single shared mutable surface of the kernel: a lock-free
//! MPSC queue for the thunks plus a mutex/condvar pair for the wakeup.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type ExternalThunk = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct ExternalShared {
    inbox: SegQueue<ExternalThunk>,
    wakeup: Mutex<bool>,
    signal: Condvar,
}

impl ExternalShared {
    /// Drains everything deposited so far, in arrival order.
    pub(crate) fn drain(&self) -> Vec<ExternalThunk> {
        let mut thunks = Vec::new();
        while let Some(thunk) = self.inbox.pop() {
            thunks.push(thunk);
        }
        thunks
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }
}

/// A cloneable, `Send` handle for depositing work from foreign threads
/// and for sleeping until the scheduler needs to run again.
#[derive(Clone)]
pub struct ExternalHandle {
    shared: Arc<ExternalShared>,
}

impl ExternalHandle {
    pub(crate) fn new(shared: Arc<ExternalShared>) -> Self {
        Self { shared }
    }

    /// Deposits a job to run on the scheduler thread. It is spliced into
    /// the normal band (under the main monitor) at the start of the next
    /// cycle, and the wakeup signal is raised.
    pub fn enqueue_external_job(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.inbox.push(Box::new(f));
        self.notify();
    }

    /// Raises the wakeup signal without depositing work.
    pub fn notify(&self) {
        let mut woken = self.shared.wakeup.lock();
        *woken = true;
        self.shared.signal.notify_one();
    }

    /// Blocks until the wakeup signal is raised or the timeout elapses.
    /// Consumes the signal; returns true if woken, false on timeout.
    ///
    /// A blocking driver combines this with
    /// [`CycleSummary::next_event_time`](crate::runtime::CycleSummary) to
    /// sleep until either an external deposit arrives or the earliest
    /// alarm is due.
    pub fn wait_for_wakeup(&self, timeout: Option<Duration>) -> bool {
        let mut woken = self.shared.wakeup.lock();
        match timeout {
            Some(timeout) => {
                if !*woken {
                    let _ = self.shared.signal.wait_for(&mut woken, timeout);
                }
            }
            None => {
                while !*woken {
                    self.shared.signal.wait(&mut woken);
                }
            }
        }
        std::mem::replace(&mut *woken, false)
    }
}

impl std::fmt::Debug for ExternalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalHandle")
            .field("pending", &!self.shared.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposits_drain_in_order() {
        let shared = Arc::new(ExternalShared::default());
        let handle = ExternalHandle::new(shared.clone());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            handle.enqueue_external_job(move || log.lock().push(i));
        }
        for thunk in shared.drain() {
            thunk();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(shared.is_empty());
    }

    #[test]
    fn wakeup_signal_is_consumed() {
        let shared = Arc::new(ExternalShared::default());
        let handle = ExternalHandle::new(shared);
        handle.notify();
        assert!(handle.wait_for_wakeup(Some(Duration::from_millis(1))));
        // Signal was consumed; next wait times out.
        assert!(!handle.wait_for_wakeup(Some(Duration::from_millis(1))));
    }

    #[test]
    fn cross_thread_deposit() {
        let shared = Arc::new(ExternalShared::default());
        let handle = ExternalHandle::new(shared.clone());
        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.enqueue_external_job(|| {});
            })
        };
        worker.join().expect("worker thread");
        assert!(handle.wait_for_wakeup(Some(Duration::from_millis(50))));
        assert_eq!(shared.drain().len(), 1);
    }
}
