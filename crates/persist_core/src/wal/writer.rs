//! The segmented transaction log.

use crate::checkpoint::{CheckpointRecord, Compactor};
use crate::dir::InstanceDir;
use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKey, SequenceNumber, TransactionId};
use crate::wal::record::LogRecord;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use persist_storage::{StorageBackend, StorageFactory};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct SegmentWriter {
    backend: Box<dyn StorageBackend>,
    commits_since_sync: usize,
    /// Set after a failed append: the tail may hold a partial record, so
    /// nothing more may follow it in this segment.
    poisoned: bool,
}

struct ActiveSegment {
    seq: SequenceNumber,
    writer: Mutex<SegmentWriter>,
}

/// Appends committing transactions to the current log segment and rolls
/// over to a new segment on request.
///
/// Each commit writes under a shared guard on the active segment (see
/// [`CommitScope`]); a roll takes it exclusively. A transaction's records
/// therefore never straddle two segments, and once a segment is sealed
/// every batch registered for it is complete.
pub struct TransactionLog {
    dir: Arc<InstanceDir>,
    factory: Arc<dyn StorageFactory>,
    compactor: Arc<Compactor>,
    max_segment_size: u64,
    sync_frequency: Arc<AtomicUsize>,
    active: RwLock<Option<ActiveSegment>>,
    recommend_roll: AtomicBool,
}

impl TransactionLog {
    /// Opens segment `seq` for writing and announces it to the compactor.
    ///
    /// `sync_frequency` is shared with the engine so the barrier can be
    /// changed while running.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be created.
    pub fn open(
        dir: Arc<InstanceDir>,
        factory: Arc<dyn StorageFactory>,
        compactor: Arc<Compactor>,
        seq: SequenceNumber,
        max_segment_size: u64,
        sync_frequency: Arc<AtomicUsize>,
    ) -> CoreResult<Self> {
        let segment = Self::create_segment(&dir, factory.as_ref(), seq)?;
        compactor.log_available(seq);
        debug!(%seq, "log segment opened");
        Ok(Self {
            dir,
            factory,
            compactor,
            max_segment_size,
            sync_frequency,
            active: RwLock::new(Some(segment)),
            recommend_roll: AtomicBool::new(false),
        })
    }

    fn create_segment(
        dir: &InstanceDir,
        factory: &dyn StorageFactory,
        seq: SequenceNumber,
    ) -> CoreResult<ActiveSegment> {
        let backend = factory.open(&dir.log_path(seq))?;
        Ok(ActiveSegment {
            seq,
            writer: Mutex::new(SegmentWriter {
                backend,
                commits_since_sync: 0,
                poisoned: false,
            }),
        })
    }

    /// Starts writing one transaction's records.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EngineDown`] after [`close`](Self::close).
    pub fn begin_commit(&self) -> CoreResult<CommitScope<'_>> {
        let guard = self.active.read();
        if guard.is_none() {
            return Err(CoreError::EngineDown);
        }
        Ok(CommitScope { log: self, guard })
    }

    /// Seals the active segment and continues in the next one.
    ///
    /// Returns the new segment's sequence. Waits for commits in progress
    /// to finish writing.
    ///
    /// # Errors
    ///
    /// If the new segment cannot be created the old one stays active.
    pub fn roll(&self) -> CoreResult<SequenceNumber> {
        let mut active = self.active.write();
        let current = active.as_ref().ok_or(CoreError::EngineDown)?;

        {
            let mut writer = current.writer.lock();
            if let Err(e) = sync_writer(&mut writer) {
                if !writer.poisoned {
                    return Err(e);
                }
                warn!(seq = %current.seq, error = %e, "sealing a failed segment without sync");
            }
        }

        let seq = current.seq.next();
        let segment = Self::create_segment(&self.dir, self.factory.as_ref(), seq)?;
        self.compactor.log_available(seq);
        let old = active.replace(segment).map(|s| s.seq);
        self.recommend_roll.store(false, Ordering::Release);
        debug!(old = ?old, new = %seq, "log rolled");
        Ok(seq)
    }

    /// Whether the active segment has grown past its size limit or can no
    /// longer be appended to.
    #[must_use]
    pub fn recommends_roll(&self) -> bool {
        self.recommend_roll.load(Ordering::Acquire)
    }

    /// Whether the active segment refused writes after a failure.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.active
            .read()
            .as_ref()
            .map_or(false, |segment| segment.writer.lock().poisoned)
    }

    /// Changes the durability barrier to every `commits` commits.
    pub fn set_sync_frequency(&self, commits: usize) {
        self.sync_frequency.store(commits.max(1), Ordering::Release);
    }

    /// Sequence of the oldest segment still on disk.
    #[must_use]
    pub fn low_sequence(&self) -> Option<SequenceNumber> {
        self.compactor.low_sequence().or_else(|| self.high_sequence())
    }

    /// Sequence of the active segment.
    #[must_use]
    pub fn high_sequence(&self) -> Option<SequenceNumber> {
        self.active.read().as_ref().map(|segment| segment.seq)
    }

    /// Drops the active segment without syncing, as a crash would.
    pub fn abandon(&self) {
        if let Some(segment) = self.active.write().take() {
            debug!(seq = %segment.seq, "log abandoned");
        }
    }

    /// Syncs and closes the active segment. Later commits fail with
    /// [`CoreError::EngineDown`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        let Some(segment) = self.active.write().take() else {
            return Ok(());
        };
        let mut writer = segment.writer.lock();
        if writer.poisoned {
            return Ok(());
        }
        sync_writer(&mut writer)?;
        debug!(seq = %segment.seq, "log closed");
        Ok(())
    }
}

fn sync_writer(writer: &mut SegmentWriter) -> CoreResult<()> {
    writer.backend.flush()?;
    writer.backend.sync()?;
    writer.commits_since_sync = 0;
    Ok(())
}

/// One transaction's view of the active segment while it commits.
///
/// Holds the segment shared: the log cannot roll until the scope is
/// dropped, so the records logged here, the end marker and the batch
/// handed to the compactor all belong to the same segment.
pub struct CommitScope<'a> {
    log: &'a TransactionLog,
    guard: RwLockReadGuard<'a, Option<ActiveSegment>>,
}

impl CommitScope<'_> {
    fn segment(&self) -> CoreResult<&ActiveSegment> {
        self.guard.as_ref().ok_or(CoreError::EngineDown)
    }

    /// Segment the records land in.
    pub fn sequence(&self) -> CoreResult<SequenceNumber> {
        Ok(self.segment()?.seq)
    }

    fn append(&self, record: &LogRecord) -> CoreResult<u64> {
        let data = record.encode()?;
        let segment = self.segment()?;
        let mut writer = segment.writer.lock();
        if writer.poisoned {
            return Err(CoreError::storage_failure(format!(
                "log segment {} refused writes after an earlier failure",
                segment.seq
            )));
        }
        match writer.backend.append(&data) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                writer.poisoned = true;
                self.log.recommend_roll.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Logs the new value of one entity; `None` logs its deletion.
    pub fn log_update(
        &self,
        txid: TransactionId,
        key: &EntityKey,
        value: Option<&[u8]>,
    ) -> CoreResult<()> {
        self.append(&LogRecord::Update {
            txid,
            key: key.clone(),
            value: value.map(<[u8]>::to_vec),
        })?;
        Ok(())
    }

    /// Logs the end marker that makes the transaction durable, then runs
    /// the barrier if this commit completes a group.
    pub fn log_end(&self, txid: TransactionId) -> CoreResult<()> {
        let offset = self.append(&LogRecord::EndOfTransaction { txid })?;

        let segment = self.segment()?;
        let mut writer = segment.writer.lock();
        writer.commits_since_sync += 1;
        let frequency = self.log.sync_frequency.load(Ordering::Acquire).max(1);
        if writer.commits_since_sync >= frequency {
            if let Err(e) = sync_writer(&mut writer) {
                writer.poisoned = true;
                self.log.recommend_roll.store(true, Ordering::Release);
                return Err(e);
            }
        }

        if offset >= self.log.max_segment_size {
            self.log.recommend_roll.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Hands the committed records to the compactor for this segment.
    pub fn record_committed(&self, records: Vec<CheckpointRecord>) -> CoreResult<()> {
        let seq = self.sequence()?;
        self.log.compactor.add_committed(seq, records);
        Ok(())
    }
}
