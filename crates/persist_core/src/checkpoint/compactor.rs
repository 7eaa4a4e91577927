//! Background folding of sealed log segments into checkpoint files.

use crate::checkpoint::compaction::compact;
use crate::checkpoint::record::CheckpointRecord;
use crate::checkpoint::writer::CheckpointWriter;
use crate::dir::InstanceDir;
use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Committed records of one log segment.
#[derive(Debug)]
pub struct Batch {
    /// The log segment the records were written to.
    pub seq: SequenceNumber,
    /// Records in commit order.
    pub records: Vec<CheckpointRecord>,
    /// Already appended to a checkpoint file, only the segment deletion is
    /// outstanding.
    written: bool,
}

impl Batch {
    /// Creates a batch for segment `seq`.
    #[must_use]
    pub fn new(seq: SequenceNumber, records: Vec<CheckpointRecord>) -> Self {
        Self {
            seq,
            records,
            written: false,
        }
    }
}

#[derive(Default)]
struct State {
    /// Oldest first. The back is the segment currently written to.
    batches: VecDeque<Batch>,
    /// Segment of the batch the worker holds.
    folding: Option<SequenceNumber>,
    stopping: bool,
    folded: u64,
    failures: u64,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

/// Folds every sealed segment's batch into the checkpoint files, then
/// deletes the segment.
///
/// A batch is only folded once a newer batch exists, so the segment being
/// written to is never touched. Folding happens strictly oldest first: a
/// segment that outlives a newer one would replay stale values over the
/// checkpoint.
pub struct Compactor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    /// Starts the compactor thread with already recovered batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(
        dir: Arc<InstanceDir>,
        writer: CheckpointWriter,
        recovered: Vec<Batch>,
        retry_interval: Duration,
    ) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                batches: recovered.into(),
                ..State::default()
            }),
            changed: Condvar::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            dir,
            writer,
            retry_interval,
        };
        let handle = thread::Builder::new()
            .name("compactor".into())
            .spawn(move || worker.run())
            .map_err(CoreError::Io)?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Opens a new batch for a freshly created log segment. Every older
    /// batch becomes eligible for folding.
    pub fn log_available(&self, seq: SequenceNumber) {
        let mut state = self.shared.state.lock();
        state.batches.push_back(Batch::new(seq, Vec::new()));
        self.shared.changed.notify_all();
    }

    /// Adds one committed transaction's records to the batch of `seq`.
    pub fn add_committed(&self, seq: SequenceNumber, records: Vec<CheckpointRecord>) {
        let mut state = self.shared.state.lock();
        match state.batches.iter_mut().rev().find(|b| b.seq == seq) {
            Some(batch) => batch.records.extend(records),
            None => {
                warn!(%seq, "committed records for an unknown segment, opening a batch");
                state.batches.push_back(Batch::new(seq, records));
            }
        }
    }

    /// The oldest segment not yet folded, if any.
    #[must_use]
    pub fn low_sequence(&self) -> Option<SequenceNumber> {
        let state = self.shared.state.lock();
        state.folding.or_else(|| state.batches.front().map(|b| b.seq))
    }

    /// Number of batches waiting, including the live one.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.shared.state.lock().batches.len()
    }

    /// Number of batches folded so far.
    #[must_use]
    pub fn folded_batches(&self) -> u64 {
        self.shared.state.lock().folded
    }

    /// Number of failed fold attempts so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.shared.state.lock().failures
    }

    /// Stops the thread and waits for it. Batches still pending stay
    /// pending: their segments remain on disk.
    pub fn shut_down(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            self.shared.changed.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("compactor thread panicked");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.shut_down();
    }
}

struct Worker {
    shared: Arc<Shared>,
    dir: Arc<InstanceDir>,
    writer: CheckpointWriter,
    retry_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        debug!("compactor started");
        while let Some(mut batch) = self.next_batch() {
            match self.fold(&mut batch) {
                Ok(()) => {
                    let mut state = self.shared.state.lock();
                    state.folding = None;
                    state.folded += 1;
                }
                Err(e) => {
                    warn!(seq = %batch.seq, error = %e, "fold failed, retrying");
                    {
                        let mut state = self.shared.state.lock();
                        state.failures += 1;
                        state.folding = None;
                        state.batches.push_front(batch);
                    }
                    self.pause();
                }
            }
        }
        debug!("compactor stopped");
    }

    /// Takes the oldest batch once a newer one exists.
    fn next_batch(&self) -> Option<Batch> {
        let mut state = self.shared.state.lock();
        loop {
            if state.stopping {
                return None;
            }
            if state.batches.len() >= 2 {
                let batch = state.batches.pop_front();
                state.folding = batch.as_ref().map(|b| b.seq);
                return batch;
            }
            self.shared.changed.wait(&mut state);
        }
    }

    fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.stopping {
            self.shared
                .changed
                .wait_for(&mut state, self.retry_interval);
        }
    }

    fn fold(&mut self, batch: &mut Batch) -> CoreResult<()> {
        if !batch.written {
            let (records, stats) = compact(std::mem::take(&mut batch.records));
            if let Err(e) = self.writer.append(&records) {
                batch.records = records;
                return Err(e);
            }
            batch.records = records;
            batch.written = true;
            debug!(
                seq = %batch.seq,
                records = stats.output_records,
                obsolete = stats.obsolete_versions_removed,
                "folded segment into checkpoint"
            );
        }

        self.dir.delete_log_segment(batch.seq)?;
        debug!(seq = %batch.seq, "deleted log segment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::writer::replay_checkpoints;
    use crate::types::EntityKey;
    use persist_storage::{FileFactory, StorageFactory};
    use std::time::Instant;
    use tempfile::tempdir;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn put(name: &str, v: u8) -> CheckpointRecord {
        CheckpointRecord::put(EntityKey::new("Integer", name), vec![v])
    }

    fn touch_log(dir: &InstanceDir, seq: u64) {
        let mut backend = FileFactory.open(&dir.log_path(SequenceNumber::new(seq))).unwrap();
        backend.append(b"x").unwrap();
    }

    fn start(dir: &Arc<InstanceDir>, recovered: Vec<Batch>) -> Compactor {
        let writer = CheckpointWriter::new(
            Arc::clone(dir),
            Arc::new(FileFactory),
            1 << 20,
            SequenceNumber::new(1),
        );
        Compactor::start(Arc::clone(dir), writer, recovered, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn live_batch_is_never_folded() {
        let tmp = tempdir().unwrap();
        let dir = Arc::new(InstanceDir::open(tmp.path(), true).unwrap());
        touch_log(&dir, 1);

        let compactor = start(&dir, Vec::new());
        compactor.log_available(SequenceNumber::new(1));
        compactor.add_committed(SequenceNumber::new(1), vec![put("x", 1)]);
        thread::sleep(Duration::from_millis(30));

        assert_eq!(compactor.folded_batches(), 0);
        assert_eq!(compactor.low_sequence(), Some(SequenceNumber::new(1)));
        assert_eq!(dir.log_sequences().unwrap(), vec![SequenceNumber::new(1)]);
        compactor.shut_down();
    }

    #[test]
    fn sealed_batches_fold_and_delete_segments() {
        let tmp = tempdir().unwrap();
        let dir = Arc::new(InstanceDir::open(tmp.path(), true).unwrap());
        for seq in 1..=3 {
            touch_log(&dir, seq);
        }

        let recovered = vec![
            Batch::new(SequenceNumber::new(1), vec![put("x", 1), put("x", 2)]),
            Batch::new(SequenceNumber::new(2), vec![put("y", 3)]),
        ];
        let compactor = start(&dir, recovered);
        compactor.log_available(SequenceNumber::new(3));

        assert!(wait_until(|| compactor.folded_batches() == 2));
        assert_eq!(compactor.low_sequence(), Some(SequenceNumber::new(3)));
        assert_eq!(dir.log_sequences().unwrap(), vec![SequenceNumber::new(3)]);
        compactor.shut_down();

        let mut replayed = Vec::new();
        replay_checkpoints(&dir, &FileFactory, |r| {
            replayed.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed, vec![put("x", 2), put("y", 3)]);
    }

    #[test]
    fn shut_down_is_idempotent_and_leaves_pending_batches() {
        let tmp = tempdir().unwrap();
        let dir = Arc::new(InstanceDir::open(tmp.path(), true).unwrap());
        let compactor = start(&dir, Vec::new());
        compactor.log_available(SequenceNumber::new(7));
        compactor.shut_down();
        compactor.shut_down();
        assert_eq!(compactor.pending_batches(), 1);
    }
}
