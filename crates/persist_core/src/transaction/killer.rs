//! The background task waking killed transactions.
//!
//! Deadlock resolution runs with the wait-for graph locked; waking the
//! victim there would mean taking its wait lock inside the resolver. The
//! resolver only marks the victim killed and queues it here.

use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct Killer {
    sender: Mutex<Option<Sender<Arc<Transaction>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Killer {
    pub(crate) fn start(poll_interval: Duration) -> CoreResult<Self> {
        let (sender, receiver) = unbounded::<Arc<Transaction>>();
        let handle = thread::Builder::new()
            .name("killer".into())
            .spawn(move || loop {
                match receiver.recv_timeout(poll_interval) {
                    Ok(victim) => {
                        debug!(txid = %victim.id(), "waking killed transaction");
                        victim.wake();
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(CoreError::Io)?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues a killed transaction to be woken.
    pub(crate) fn enqueue(&self, victim: Arc<Transaction>) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(victim).is_err() {
                    warn!("killer stopped, victim not woken");
                }
            }
            // Stopped: the victim notices at its next bounded wake.
            None => debug!(txid = %victim.id(), "killer stopped, not queued"),
        }
    }

    /// Stops the task once everything queued has been delivered.
    pub(crate) fn shut_down(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("killer thread panicked");
            }
        }
    }
}

impl Drop for Killer {
    fn drop(&mut self) {
        // Not joined: the last reference may be dropped on the killer
        // thread itself. Disconnecting is enough to end it.
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::testing::running_manager;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn queued_victim_is_woken() {
        let tmp = tempdir().unwrap();
        let manager = running_manager(tmp.path());
        let tx = manager.new_transaction().unwrap();
        let killer = Killer::start(Duration::from_millis(10)).unwrap();

        killer.enqueue(Arc::clone(&tx));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !tx.has_pending_wake() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(tx.has_pending_wake());

        killer.shut_down();
        tx.rollback();
        manager.shut_down().unwrap();
    }

    #[test]
    fn enqueue_after_shut_down_is_dropped() {
        let tmp = tempdir().unwrap();
        let manager = running_manager(tmp.path());
        let tx = manager.new_transaction().unwrap();
        let killer = Killer::start(Duration::from_millis(10)).unwrap();
        killer.shut_down();
        killer.shut_down();

        killer.enqueue(Arc::clone(&tx));
        assert!(!tx.has_pending_wake());
        tx.rollback();
        manager.shut_down().unwrap();
    }
}
