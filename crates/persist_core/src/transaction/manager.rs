//! Transaction manager.

use crate::checkpoint::Compactor;
use crate::config::Config;
use crate::dir::InstanceDir;
use crate::entity::Entity;
use crate::error::CoreResult;
use crate::store::Library;
use crate::transaction::graph::WaitForGraph;
use crate::transaction::killer::Killer;
use crate::transaction::Transaction;
use crate::types::{EntityKey, TransactionId};
use crate::wal::TransactionLog;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) type HeldEntities = HashMap<EntityKey, Arc<Entity>>;

#[derive(Default)]
struct Admission {
    active: HashMap<TransactionId, Arc<Transaction>>,
    quiescing: bool,
}

/// Coordinates the transactions of one running engine.
///
/// The manager provides:
/// - Admission of new transactions, paused while a checkpoint quiesces
/// - The wait-for graph and deadlock resolution
/// - Size-triggered checkpoints: rolling the log so the compactor can
///   fold the sealed segment
///
/// ## Lock Order
///
/// wait-for graph → admission → a transaction's wake lock. Entity locks
/// are never held while taking any of these.
pub struct TransactionManager {
    dir: Arc<InstanceDir>,
    config: Config,
    library: Arc<Library>,
    log: TransactionLog,
    compactor: Arc<Compactor>,
    killer: Killer,
    graph: Mutex<WaitForGraph>,
    admission: Mutex<Admission>,
    admission_changed: Condvar,
    pool: Mutex<Vec<HeldEntities>>,
    next_txid: Arc<AtomicU64>,
    commits_in_flight: AtomicUsize,
    running: AtomicBool,
    checkpointing: AtomicBool,
}

impl TransactionManager {
    /// Starts a manager over recovered state.
    ///
    /// `next_txid` is shared with the engine so ids stay unique across
    /// restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the killer thread cannot be started.
    pub fn start(
        dir: Arc<InstanceDir>,
        config: Config,
        library: Arc<Library>,
        log: TransactionLog,
        compactor: Arc<Compactor>,
        next_txid: Arc<AtomicU64>,
    ) -> CoreResult<Arc<Self>> {
        let killer = Killer::start(config.killer_poll_interval)?;
        Ok(Arc::new(Self {
            dir,
            config,
            library,
            log,
            compactor,
            killer,
            graph: Mutex::new(WaitForGraph::default()),
            admission: Mutex::new(Admission::default()),
            admission_changed: Condvar::new(),
            pool: Mutex::new(Vec::new()),
            next_txid,
            commits_in_flight: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            checkpointing: AtomicBool::new(false),
        }))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the object store.
    #[must_use]
    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// Returns the log.
    #[must_use]
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Returns the compactor.
    #[must_use]
    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    /// Returns the instance directory.
    #[must_use]
    pub fn dir(&self) -> &Arc<InstanceDir> {
        &self.dir
    }

    /// Whether new transactions are admitted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts a transaction. Waits while a checkpoint quiesces; returns
    /// `None` once the engine is down.
    pub fn new_transaction(self: &Arc<Self>) -> Option<Arc<Transaction>> {
        let mut admission = self.admission.lock();
        while admission.quiescing && self.is_running() {
            self.admission_changed.wait(&mut admission);
        }
        if !self.is_running() {
            return None;
        }

        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let held = self.pool.lock().pop().unwrap_or_default();
        let tx = Arc::new(Transaction::new(id, held, Arc::clone(self)));
        admission.active.insert(id, Arc::clone(&tx));
        Some(tx)
    }

    /// Looks up an entity, creating an absent one.
    pub fn get_entity(&self, key: &EntityKey) -> Arc<Entity> {
        self.library.get_or_create(key)
    }

    /// Looks up an entity without creating it.
    #[must_use]
    pub fn lookup_entity(&self, key: &EntityKey) -> Option<Arc<Entity>> {
        self.library.read(key)
    }

    /// Records that `victim` waits for `blocker`, then resolves any
    /// deadlock this closes.
    ///
    /// Returns `false` without recording anything if either side is no
    /// longer alive; the caller should retry shortly.
    pub fn add_block(&self, victim: &Arc<Transaction>, blocker: TransactionId) -> bool {
        let mut graph = self.graph.lock();
        let blocker_tx = self.admission.lock().active.get(&blocker).cloned();
        let Some(blocker_tx) = blocker_tx else {
            return false;
        };
        if !victim.is_alive() || !blocker_tx.is_alive() {
            return false;
        }

        graph.add_edge(victim.id(), blocker);
        if let Some(cycle) = graph.find_cycle(victim.id()) {
            let chosen = choose_victim(victim, &blocker_tx);
            debug!(
                victim = %victim.id(),
                blocker = %blocker,
                cycle_len = cycle.len(),
                killed = %chosen.id(),
                "deadlock detected"
            );
            chosen.kill();
            graph.remove_edge(chosen.id());
            self.killer.enqueue(Arc::clone(chosen));
        }
        true
    }

    /// Clears whatever `victim` was waiting for.
    pub fn clear_block(&self, victim: TransactionId) {
        self.graph.lock().remove_edge(victim);
    }

    /// Number of transactions waiting for another.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.graph.lock().len()
    }

    pub(crate) fn start_commit(&self) {
        self.commits_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_commit(&self) {
        self.commits_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of commits between phase one and release.
    #[must_use]
    pub fn commits_in_flight(&self) -> usize {
        self.commits_in_flight.load(Ordering::Acquire)
    }

    /// Number of live transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.admission.lock().active.len()
    }

    /// Forgets a finished transaction: wakes everything it blocked, recycles
    /// its buffer, and schedules a checkpoint if the log asks for one.
    pub(crate) fn remove_transaction(self: &Arc<Self>, tx: &Transaction) {
        let (woken, quiescing) = {
            let mut graph = self.graph.lock();
            let waiters = graph.remove_transaction(tx.id());
            let mut admission = self.admission.lock();
            admission.active.remove(&tx.id());
            let woken: Vec<Arc<Transaction>> = waiters
                .iter()
                .filter_map(|id| admission.active.get(id).cloned())
                .collect();
            if admission.quiescing && admission.active.is_empty() {
                self.admission_changed.notify_all();
            }
            (woken, admission.quiescing)
        };
        for waiter in woken {
            waiter.wake();
        }

        let mut held = tx.take_held();
        held.clear();
        {
            let mut pool = self.pool.lock();
            if pool.len() < self.config.transaction_pool_size {
                pool.push(held);
            }
        }

        if !quiescing && self.is_running() && self.log.recommends_roll() {
            self.spawn_checkpoint();
        }
    }

    fn spawn_checkpoint(self: &Arc<Self>) {
        if self
            .checkpointing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("checkpoint".into())
            .spawn(move || {
                if let Err(e) = manager.checkpoint() {
                    warn!(error = %e, "checkpoint failed");
                }
                manager.checkpointing.store(false, Ordering::Release);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not start checkpoint thread");
            self.checkpointing.store(false, Ordering::Release);
        }
    }

    /// Pauses admission, waits briefly for live transactions to finish and
    /// rolls the log. Returns whether a roll happened.
    ///
    /// The wait is best effort: the roll proceeds after the quiesce timeout
    /// even with transactions still running.
    ///
    /// # Errors
    ///
    /// Returns an error if the new segment cannot be created.
    pub fn checkpoint(&self) -> CoreResult<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        {
            let mut admission = self.admission.lock();
            if admission.quiescing {
                return Ok(false);
            }
            admission.quiescing = true;
            let deadline = Instant::now() + self.config.quiesce_timeout;
            while !admission.active.is_empty() {
                if self
                    .admission_changed
                    .wait_until(&mut admission, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        let result = self.log.roll();

        {
            let mut admission = self.admission.lock();
            admission.quiescing = false;
            self.admission_changed.notify_all();
        }
        let seq = result?;
        debug!(%seq, "checkpoint rolled the log");
        Ok(true)
    }

    /// Kills every live transaction and waits for nothing.
    fn kill_all(&self) {
        let active: Vec<Arc<Transaction>> = {
            let mut admission = self.admission.lock();
            admission.quiescing = false;
            self.admission_changed.notify_all();
            admission.active.values().cloned().collect()
        };
        for tx in active {
            tx.kill();
            tx.wake();
        }
    }

    /// Stops admission and the background threads, then closes the log.
    ///
    /// Live transactions are killed; a commit already writing finishes
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log's final sync fails.
    pub fn shut_down(&self) -> CoreResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.kill_all();
        self.compactor.shut_down();
        self.killer.shut_down();
        let result = self.log.close();
        info!(
            folded = self.compactor.folded_batches(),
            "transaction manager stopped"
        );
        result
    }

    /// Stops like a crash would: nothing more is written or synced.
    pub fn halt(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.kill_all();
        self.compactor.shut_down();
        self.killer.shut_down();
        self.log.abandon();
        info!("transaction manager halted");
    }
}

/// Orders the two sides of a deadlock: fewer held entities first, then
/// earlier creation, then lower id. The lower rank dies.
type VictimRank = (usize, Instant, TransactionId);

fn victim_rank(tx: &Transaction) -> VictimRank {
    (tx.held_count(), tx.created(), tx.id())
}

/// Of a deadlocked pair, the one holding fewer entities dies; on a tie,
/// the older one.
fn choose_victim<'a>(victim: &'a Arc<Transaction>, blocker: &'a Arc<Transaction>) -> &'a Arc<Transaction> {
    if victim_rank(victim) <= victim_rank(blocker) {
        victim
    } else {
        blocker
    }
}
