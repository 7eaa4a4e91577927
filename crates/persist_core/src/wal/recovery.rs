//! Replaying the log after a restart.

use crate::checkpoint::{Batch, CheckpointRecord};
use crate::dir::InstanceDir;
use crate::error::CoreResult;
use crate::types::{EntityKey, SequenceNumber, TransactionId};
use crate::wal::iterator::LogRecordIterator;
use crate::wal::record::LogRecord;
use persist_storage::StorageFactory;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Outcome of replaying the log segments.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Segments read.
    pub segments: usize,
    /// Transactions whose updates were applied.
    pub applied: usize,
    /// Transactions without an end marker, ignored.
    pub discarded: usize,
    /// Highest transaction id seen in any record.
    pub max_txid: Option<TransactionId>,
    /// Oldest segment found.
    pub low: Option<SequenceNumber>,
    /// Newest segment found.
    pub high: Option<SequenceNumber>,
    /// Committed records of each segment, oldest first, for the compactor.
    pub batches: Vec<Batch>,
}

/// Replays every log segment in `dir`, oldest first.
///
/// Runs in two passes. The first validates every segment and collects the
/// transactions that have an end marker; corruption anywhere fails the
/// whole recovery before anything is applied. The second applies the
/// committed transactions, each as a unit, in end-marker order.
///
/// `apply` receives each committed update: the frozen value, or `None` for
/// a deletion.
///
/// # Errors
///
/// Returns the first corruption or I/O error encountered.
pub fn recover<F>(
    dir: &InstanceDir,
    factory: &dyn StorageFactory,
    mut apply: F,
) -> CoreResult<RecoverySummary>
where
    F: FnMut(&EntityKey, Option<&[u8]>) -> CoreResult<()>,
{
    let sequences = dir.log_sequences()?;
    let mut summary = RecoverySummary {
        segments: sequences.len(),
        low: sequences.first().copied(),
        high: sequences.last().copied(),
        ..RecoverySummary::default()
    };

    // Pass 1: validate and find committed transactions.
    let mut committed: HashSet<TransactionId> = HashSet::new();
    let mut seen: HashSet<TransactionId> = HashSet::new();
    for &seq in &sequences {
        let backend = factory.open(&dir.log_path(seq))?;
        for item in LogRecordIterator::new(backend.as_ref())? {
            let (_, record) = item?;
            let txid = record.txid();
            summary.max_txid = summary.max_txid.max(Some(txid));
            seen.insert(txid);
            if let LogRecord::EndOfTransaction { txid } = record {
                committed.insert(txid);
            }
        }
    }
    summary.discarded = seen.difference(&committed).count();

    // Pass 2: apply committed transactions, buffering until the end marker.
    let mut pending: HashMap<TransactionId, Vec<(EntityKey, Option<Vec<u8>>)>> = HashMap::new();
    for &seq in &sequences {
        let backend = factory.open(&dir.log_path(seq))?;
        let mut batch = Vec::new();
        for item in LogRecordIterator::new(backend.as_ref())? {
            match item?.1 {
                LogRecord::Update { txid, key, value } => {
                    if committed.contains(&txid) {
                        pending.entry(txid).or_default().push((key, value));
                    }
                }
                LogRecord::EndOfTransaction { txid } => {
                    let updates = pending.remove(&txid).unwrap_or_default();
                    for (key, value) in &updates {
                        apply(key, value.as_deref())?;
                    }
                    batch.extend(
                        updates
                            .into_iter()
                            .map(|(key, value)| CheckpointRecord { key, value }),
                    );
                    summary.applied += 1;
                }
            }
        }
        debug!(%seq, records = batch.len(), "replayed log segment");
        summary.batches.push(Batch::new(seq, batch));
    }

    info!(
        segments = summary.segments,
        applied = summary.applied,
        discarded = summary.discarded,
        "log recovery complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use persist_storage::{FileFactory, StorageBackend};
    use tempfile::tempdir;

    fn write_segment(dir: &InstanceDir, seq: u64, records: &[LogRecord]) -> Box<dyn StorageBackend> {
        let mut backend = FileFactory.open(&dir.log_path(SequenceNumber::new(seq))).unwrap();
        for r in records {
            backend.append(&r.encode().unwrap()).unwrap();
        }
        backend.sync().unwrap();
        backend
    }

    fn update(txid: u64, name: &str, value: Option<u8>) -> LogRecord {
        LogRecord::Update {
            txid: TransactionId::new(txid),
            key: EntityKey::new("Integer", name),
            value: value.map(|v| vec![v]),
        }
    }

    fn end(txid: u64) -> LogRecord {
        LogRecord::EndOfTransaction {
            txid: TransactionId::new(txid),
        }
    }

    fn run(dir: &InstanceDir) -> CoreResult<(RecoverySummary, Vec<(String, Option<Vec<u8>>)>)> {
        let mut applied = Vec::new();
        let summary = recover(dir, &FileFactory, |key, value| {
            applied.push((key.name.clone(), value.map(<[u8]>::to_vec)));
            Ok(())
        })?;
        Ok((summary, applied))
    }

    #[test]
    fn empty_directory() {
        let tmp = tempdir().unwrap();
        let dir = InstanceDir::open(tmp.path(), true).unwrap();
        let (summary, applied) = run(&dir).unwrap();
        assert_eq!(summary.segments, 0);
        assert!(summary.high.is_none());
        assert!(applied.is_empty());
    }

    #[test]
    fn only_transactions_with_end_marker_apply() {
        let tmp = tempdir().unwrap();
        let dir = InstanceDir::open(tmp.path(), true).unwrap();
        write_segment(
            &dir,
            1,
            &[
                update(1, "a", Some(1)),
                update(2, "b", Some(2)),
                update(1, "c", None),
                end(1),
                update(3, "d", Some(4)),
            ],
        );

        let (summary, applied) = run(&dir).unwrap();
        assert_eq!(
            applied,
            vec![("a".to_string(), Some(vec![1])), ("c".to_string(), None)]
        );
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.discarded, 2);
        assert_eq!(summary.max_txid, Some(TransactionId::new(3)));
        assert_eq!(summary.batches.len(), 1);
        assert_eq!(summary.batches[0].records.len(), 2);
    }

    #[test]
    fn segments_replay_in_order() {
        let tmp = tempdir().unwrap();
        let dir = InstanceDir::open(tmp.path(), true).unwrap();
        write_segment(&dir, 3, &[update(5, "x", Some(1)), end(5)]);
        write_segment(&dir, 4, &[update(6, "x", Some(2)), end(6)]);

        let (summary, applied) = run(&dir).unwrap();
        assert_eq!(applied.last().unwrap().1, Some(vec![2]));
        assert_eq!(summary.low, Some(SequenceNumber::new(3)));
        assert_eq!(summary.high, Some(SequenceNumber::new(4)));
        let seqs: Vec<_> = summary.batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![SequenceNumber::new(3), SequenceNumber::new(4)]);
    }

    #[test]
    fn torn_tail_drops_only_the_unfinished_commit() {
        let tmp = tempdir().unwrap();
        let dir = InstanceDir::open(tmp.path(), true).unwrap();
        let mut backend = write_segment(&dir, 1, &[update(1, "a", Some(1)), end(1), update(2, "b", Some(2))]);
        let partial = end(2).encode().unwrap();
        backend.append(&partial[..partial.len() - 2]).unwrap();
        drop(backend);

        let (summary, applied) = run(&dir).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(summary.discarded, 1);
    }

    #[test]
    fn corruption_applies_nothing() {
        let tmp = tempdir().unwrap();
        let dir = InstanceDir::open(tmp.path(), true).unwrap();
        write_segment(&dir, 1, &[update(1, "a", Some(1)), end(1)]);
        let mut bad = update(2, "b", Some(2)).encode().unwrap();
        bad[12] ^= 0x01;
        let mut backend = FileFactory.open(&dir.log_path(SequenceNumber::new(2))).unwrap();
        backend.append(&bad).unwrap();
        backend.append(&end(2).encode().unwrap()).unwrap();
        drop(backend);

        let mut applied = 0;
        let result = recover(&dir, &FileFactory, |_, _| {
            applied += 1;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
        assert_eq!(applied, 0);
    }
}
