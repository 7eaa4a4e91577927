//! Streaming iteration over one log segment.
//!
//! Records are read one at a time through a bounded buffer, so replaying
//! a large segment does not load it into memory.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::wal::record::{LogRecord, LogRecordType, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
use persist_storage::StorageBackend;

const READ_CHUNK: usize = 64 * 1024;

/// Iterates the records of a log segment as `(offset, record)` pairs.
///
/// A header or body cut short by the end of the segment ends iteration
/// cleanly: that is a write interrupted by a crash. Bad magic, an unknown
/// type, a future version or a CRC mismatch is corruption and yields an
/// error, after which the iterator is exhausted.
pub struct LogRecordIterator<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    /// Offset of `buffer[0]` in the segment.
    buffer_offset: u64,
    buffer: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<'a> LogRecordIterator<'a> {
    /// Starts iterating at offset zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            backend,
            total_size: backend.size()?,
            buffer_offset: 0,
            buffer: Vec::new(),
            pos: 0,
            finished: false,
        })
    }

    /// Offset of the next unread byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.buffer_offset + self.pos as u64
    }

    /// Makes `len` bytes available at `pos`. Returns `false` at end of segment.
    fn fill(&mut self, len: usize) -> CoreResult<bool> {
        if self.buffer.len() - self.pos >= len {
            return Ok(true);
        }
        let start = self.offset();
        let remaining = self.total_size.saturating_sub(start);
        if remaining < len as u64 {
            return Ok(false);
        }
        let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(len.max(READ_CHUNK));
        self.buffer = self.backend.read_at(start, want)?;
        self.buffer_offset = start;
        self.pos = 0;
        Ok(true)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, LogRecord)>> {
        let start = self.offset();
        if !self.fill(HEADER_SIZE)? {
            return Ok(None);
        }

        let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
        if header[..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!("invalid magic at offset {start}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }
        let record_type = LogRecordType::from_byte(header[6]).ok_or_else(|| {
            CoreError::log_corruption(format!("unknown record type {} at offset {start}", header[6]))
        })?;
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if !self.fill(total)? {
            return Ok(None);
        }

        let record = &self.buffer[self.pos..self.pos + total];
        let (body, stored) = record.split_at(HEADER_SIZE + payload_len);
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let computed = crc32(body);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let decoded = LogRecord::decode_payload(record_type, &body[HEADER_SIZE..])?;
        self.pos += total;
        Ok(Some((start, decoded)))
    }
}

impl Iterator for LogRecordIterator<'_> {
    type Item = CoreResult<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKey, TransactionId};
    use persist_storage::InMemoryBackend;

    fn records() -> Vec<LogRecord> {
        vec![
            LogRecord::Update {
                txid: TransactionId::new(1),
                key: EntityKey::new("Integer", "x"),
                value: Some(vec![0x05]),
            },
            LogRecord::Update {
                txid: TransactionId::new(2),
                key: EntityKey::new("Text", "y"),
                value: None,
            },
            LogRecord::EndOfTransaction {
                txid: TransactionId::new(1),
            },
        ]
    }

    fn segment(records: &[LogRecord]) -> Vec<u8> {
        records.iter().flat_map(|r| r.encode().unwrap()).collect()
    }

    fn collect(data: Vec<u8>) -> CoreResult<Vec<LogRecord>> {
        let backend = InMemoryBackend::with_data(data);
        LogRecordIterator::new(&backend)?
            .map(|r| r.map(|(_, record)| record))
            .collect()
    }

    #[test]
    fn empty_segment_yields_nothing() {
        assert!(collect(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn reads_records_in_order_with_offsets() {
        let data = segment(&records());
        let first_len = records()[0].encode().unwrap().len() as u64;
        let backend = InMemoryBackend::with_data(data);
        let offsets: Vec<u64> = LogRecordIterator::new(&backend)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], first_len);
    }

    #[test]
    fn truncated_tail_is_a_clean_end() {
        let mut data = segment(&records());
        let full = data.len();
        data.truncate(full - 3);
        assert_eq!(collect(data.clone()).unwrap(), records()[..2].to_vec());

        // Only part of a header.
        let mut data = segment(&records()[..1]);
        data.extend_from_slice(b"PWA");
        assert_eq!(collect(data).unwrap().len(), 1);
    }

    #[test]
    fn flipped_bit_is_fatal() {
        let mut data = segment(&records());
        data[HEADER_SIZE + 2] ^= 0x40;
        let result = collect(data);
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut data = segment(&records());
        data[0] = b'X';
        assert!(matches!(collect(data), Err(CoreError::LogCorruption { .. })));
    }

    #[test]
    fn records_larger_than_the_read_chunk() {
        let big = LogRecord::Update {
            txid: TransactionId::new(9),
            key: EntityKey::new("Bytes", "blob"),
            value: Some(vec![0xAB; READ_CHUNK * 2]),
        };
        let end = LogRecord::EndOfTransaction {
            txid: TransactionId::new(9),
        };
        let data = segment(&[big.clone(), end.clone()]);
        assert_eq!(collect(data).unwrap(), vec![big, end]);
    }
}
