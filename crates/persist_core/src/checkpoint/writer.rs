//! Appending folded records to checkpoint files, and replaying them.

use crate::checkpoint::record::{read_records, CheckpointRecord};
use crate::dir::InstanceDir;
use crate::error::CoreResult;
use crate::types::SequenceNumber;
use persist_storage::{StorageBackend, StorageFactory};
use std::sync::Arc;
use tracing::debug;

/// Appends records to `ckp-N`, moving on to `ckp-N+1` once the file
/// grows past the configured size.
pub struct CheckpointWriter {
    dir: Arc<InstanceDir>,
    factory: Arc<dyn StorageFactory>,
    max_file_size: u64,
    seq: SequenceNumber,
    backend: Option<Box<dyn StorageBackend>>,
}

impl CheckpointWriter {
    /// Creates a writer whose first file is `ckp-{seq}`.
    pub fn new(
        dir: Arc<InstanceDir>,
        factory: Arc<dyn StorageFactory>,
        max_file_size: u64,
        seq: SequenceNumber,
    ) -> Self {
        Self {
            dir,
            factory,
            max_file_size,
            seq,
            backend: None,
        }
    }

    /// Sequence of the file currently written to.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.seq
    }

    /// Appends `records` and syncs them to disk.
    ///
    /// # Errors
    ///
    /// A failed write may leave a torn record at the end of the file, so
    /// the next call continues in a fresh file. The torn tail reads back
    /// as the end of the old one, and records appended twice are harmless.
    pub fn append(&mut self, records: &[CheckpointRecord]) -> CoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut data = Vec::with_capacity(records.iter().map(CheckpointRecord::encoded_size).sum());
        for record in records {
            data.extend(record.encode()?);
        }

        let result = self.write(&data);
        if result.is_err() && self.backend.take().is_some() {
            debug!(seq = %self.seq, "checkpoint write failed, moving to a new file");
            self.seq = self.seq.next();
        }
        result
    }

    fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => self.factory.open(&self.dir.checkpoint_path(self.seq))?,
        };
        let backend = self.backend.insert(backend);
        backend.append(data)?;
        backend.flush()?;
        backend.sync()?;

        if backend.size()? >= self.max_file_size {
            debug!(seq = %self.seq, "checkpoint file full, rolling");
            self.backend = None;
            self.seq = self.seq.next();
        }
        Ok(())
    }
}

/// Replays every checkpoint file, oldest first, and returns the sequence
/// the next checkpoint file should use.
pub fn replay_checkpoints<F>(
    dir: &InstanceDir,
    factory: &dyn StorageFactory,
    mut apply: F,
) -> CoreResult<SequenceNumber>
where
    F: FnMut(CheckpointRecord) -> CoreResult<()>,
{
    let sequences = dir.checkpoint_sequences()?;
    for &seq in &sequences {
        let backend = factory.open(&dir.checkpoint_path(seq))?;
        let records = read_records(backend.as_ref())?;
        debug!(%seq, records = records.len(), "replaying checkpoint");
        for record in records {
            apply(record)?;
        }
    }
    Ok(sequences
        .last()
        .map_or(SequenceNumber::new(1), |seq| seq.next()))
}
