//! Log record types and serialization.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKey, TransactionId, TypeName};

/// Magic bytes opening every log record.
pub const LOG_MAGIC: [u8; 4] = *b"PWAL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// New value (or deletion) of one entity.
    Update = 1,
    /// Commit marker for a transaction.
    EndOfTransaction = 2,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Update),
            2 => Some(Self::EndOfTransaction),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A record in the write-ahead log.
///
/// Updates only take effect once an `EndOfTransaction` with the same id
/// follows them. Records of concurrent transactions may interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// The committed value of one entity.
    Update {
        /// Owning transaction.
        txid: TransactionId,
        /// Entity updated.
        key: EntityKey,
        /// Frozen value, or `None` for a deletion.
        value: Option<Vec<u8>>,
    },

    /// Everything logged earlier under `txid` is committed.
    EndOfTransaction {
        /// The committed transaction.
        txid: TransactionId,
    },
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Update { .. } => LogRecordType::Update,
            Self::EndOfTransaction { .. } => LogRecordType::EndOfTransaction,
        }
    }

    /// Returns the transaction the record belongs to.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Update { txid, .. } | Self::EndOfTransaction { txid } => *txid,
        }
    }

    /// Serializes the payload (without envelope).
    ///
    /// # Errors
    ///
    /// Fails if a type name, entity name or value is too large for its
    /// length field.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Update { txid, key, value } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());

                let type_len = u16::try_from(key.type_name.as_str().len())
                    .map_err(|_| CoreError::log_corruption("type name longer than 65535 bytes"))?;
                buf.extend_from_slice(&type_len.to_le_bytes());
                buf.extend_from_slice(key.type_name.as_str().as_bytes());

                put_len32(&mut buf, key.name.len(), "entity name")?;
                buf.extend_from_slice(key.name.as_bytes());

                match value {
                    Some(bytes) => {
                        buf.push(1);
                        put_len32(&mut buf, bytes.len(), "value")?;
                        buf.extend_from_slice(bytes);
                    }
                    None => buf.push(0),
                }
            }
            Self::EndOfTransaction { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = PayloadCursor { payload, pos: 0 };
        let txid = TransactionId::new(cursor.u64()?);

        let record = match record_type {
            LogRecordType::Update => {
                let type_len = usize::from(cursor.u16()?);
                let type_name = cursor.utf8(type_len, "type name")?;
                let name_len = cursor.u32()? as usize;
                let name = cursor.utf8(name_len, "entity name")?;
                let value = match cursor.u8()? {
                    0 => None,
                    1 => {
                        let len = cursor.u32()? as usize;
                        Some(cursor.bytes(len)?.to_vec())
                    }
                    other => {
                        return Err(CoreError::log_corruption(format!(
                            "invalid value flag {other}"
                        )))
                    }
                };
                Self::Update {
                    txid,
                    key: EntityKey::new(TypeName::from(type_name), name),
                    value,
                }
            }
            LogRecordType::EndOfTransaction => Self::EndOfTransaction { txid },
        };

        if cursor.pos != payload.len() {
            return Err(CoreError::log_corruption(format!(
                "trailing bytes in {:?} record: used {} of {}",
                record_type,
                cursor.pos,
                payload.len()
            )));
        }
        Ok(record)
    }

    /// Serializes the full record: envelope, payload and CRC.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::log_corruption("record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

fn put_len32(buf: &mut Vec<u8>, len: usize, what: &str) -> CoreResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| CoreError::log_corruption(format!("{what} longer than 4 GiB")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

struct PayloadCursor<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.payload.len())
            .ok_or_else(|| CoreError::log_corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn utf8(&mut self, len: usize, what: &str) -> CoreResult<String> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::log_corruption(format!("{what} is not UTF-8")))
    }
}
