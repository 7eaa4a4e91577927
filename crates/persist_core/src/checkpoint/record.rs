//! Checkpoint record format.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKey, TypeName};
use persist_storage::StorageBackend;

/// Flags for checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The entity was deleted.
    pub const TOMBSTONE: Self = Self(0x01);

    /// Creates flags from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks if the tombstone flag is set.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// The committed state of one entity, as folded out of the log.
///
/// Also the unit the commit path hands to the compactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Entity this record belongs to.
    pub key: EntityKey,
    /// Frozen value, or `None` for a tombstone.
    pub value: Option<Vec<u8>>,
}

impl CheckpointRecord {
    /// record_len (4) + flags (1) + type_len (2) + name_len (4)
    const FIXED_SIZE: usize = 11;
    const CRC_SIZE: usize = 4;

    /// Creates a record carrying a value.
    #[must_use]
    pub fn put(key: EntityKey, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// Creates a tombstone.
    #[must_use]
    pub fn tombstone(key: EntityKey) -> Self {
        Self { key, value: None }
    }

    /// Returns whether this is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    fn flags(&self) -> RecordFlags {
        if self.is_tombstone() {
            RecordFlags::TOMBSTONE
        } else {
            RecordFlags::NONE
        }
    }

    /// Size of the encoded record in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::FIXED_SIZE
            + self.key.type_name.as_str().len()
            + self.key.name.len()
            + self.value.as_ref().map_or(0, Vec::len)
            + Self::CRC_SIZE
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// Fails if the record does not fit its length fields.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let record_len = u32::try_from(self.encoded_size())
            .map_err(|_| CoreError::checkpoint_corruption("record larger than 4 GiB"))?;
        let type_name = self.key.type_name.as_str().as_bytes();
        let type_len = u16::try_from(type_name.len())
            .map_err(|_| CoreError::checkpoint_corruption("type name longer than 65535 bytes"))?;

        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&record_len.to_le_bytes());
        buf.push(self.flags().as_byte());
        buf.extend_from_slice(&type_len.to_le_bytes());
        buf.extend_from_slice(type_name);
        // Fits: bounded by record_len above.
        buf.extend_from_slice(&(self.key.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.key.name.as_bytes());
        if let Some(value) = &self.value {
            buf.extend_from_slice(value);
        }
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one complete record.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::FIXED_SIZE + Self::CRC_SIZE {
            return Err(CoreError::checkpoint_corruption("record too short"));
        }
        let record_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_len < Self::FIXED_SIZE + Self::CRC_SIZE || data.len() != record_len {
            return Err(CoreError::checkpoint_corruption(format!(
                "record length {record_len} does not match {} bytes",
                data.len()
            )));
        }

        let (body, crc) = data.split_at(record_len - Self::CRC_SIZE);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = crc32(body);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let flags = RecordFlags::from_byte(body[4]);
        let type_len = usize::from(u16::from_le_bytes([body[5], body[6]]));
        let type_end = 7 + type_len;
        if body.len() < type_end + 4 {
            return Err(CoreError::checkpoint_corruption("type name overruns record"));
        }
        let type_name = std::str::from_utf8(&body[7..type_end])
            .map_err(|_| CoreError::checkpoint_corruption("type name is not UTF-8"))?;

        let name_len = u32::from_le_bytes([
            body[type_end],
            body[type_end + 1],
            body[type_end + 2],
            body[type_end + 3],
        ]) as usize;
        let name_start = type_end + 4;
        let name_end = name_start
            .checked_add(name_len)
            .filter(|&end| end <= body.len())
            .ok_or_else(|| CoreError::checkpoint_corruption("entity name overruns record"))?;
        let name = std::str::from_utf8(&body[name_start..name_end])
            .map_err(|_| CoreError::checkpoint_corruption("entity name is not UTF-8"))?;

        let payload = &body[name_end..];
        let key = EntityKey::new(TypeName::from(type_name), name);
        if flags.is_tombstone() {
            if !payload.is_empty() {
                return Err(CoreError::checkpoint_corruption(format!(
                    "tombstone for {key} carries a payload"
                )));
            }
            Ok(Self::tombstone(key))
        } else {
            Ok(Self::put(key, payload.to_vec()))
        }
    }
}

/// Reads every record of a checkpoint file, in order.
///
/// A record cut short at the end of the file ends the scan: it was being
/// appended when the process stopped, and the log segment it came from
/// has not been deleted yet.
pub fn read_records(backend: &dyn StorageBackend) -> CoreResult<Vec<CheckpointRecord>> {
    let size = backend.size()?;
    let mut offset = 0u64;
    let mut records = Vec::new();
    while size - offset >= 4 {
        let len_bytes = backend.read_at(offset, 4)?;
        let record_len =
            u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as u64;
        if record_len < 4 {
            return Err(CoreError::checkpoint_corruption(format!(
                "invalid record length {record_len} at offset {offset}"
            )));
        }
        if size - offset < record_len {
            break;
        }
        let data = backend.read_at(offset, record_len as usize)?;
        records.push(CheckpointRecord::decode(&data)?);
        offset += record_len;
    }
    Ok(records)
}
