//! The consolidated snapshot written at shutdown.
//!
//! ```text
//! | magic "PSNP" (4) | version (2) | crc32 of body (4) | body |
//! ```
//!
//! The body is one frozen map: type name → (entity name → frozen value).

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKey, TypeName};
use persist_codec::{freeze, thaw, Value};

/// Magic bytes opening the snapshot file.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"PSNP";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;

/// Encodes `(key, frozen value)` pairs.
pub fn encode(entries: Vec<(EntityKey, Vec<u8>)>) -> CoreResult<Vec<u8>> {
    let mut by_type: Vec<(TypeName, Vec<(Value, Value)>)> = Vec::new();
    let mut sorted = entries;
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, frozen) in sorted {
        let entry = (Value::Text(key.name), Value::Bytes(frozen));
        match by_type.last_mut() {
            Some((type_name, names)) if *type_name == key.type_name => names.push(entry),
            _ => by_type.push((key.type_name, vec![entry])),
        }
    }

    let body = Value::map(
        by_type
            .into_iter()
            .map(|(type_name, names)| (Value::text(type_name.as_str()), Value::map(names)))
            .collect(),
    );
    let body = freeze(&body)?;

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.extend_from_slice(&SNAPSHOT_MAGIC);
    data.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    data.extend_from_slice(&crc32(&body).to_le_bytes());
    data.extend_from_slice(&body);
    Ok(data)
}

/// Decodes a snapshot into `(key, frozen value)` pairs.
pub fn decode(data: &[u8]) -> CoreResult<Vec<(EntityKey, Vec<u8>)>> {
    if data.len() < HEADER_SIZE {
        return Err(CoreError::snapshot_corruption("file too short"));
    }
    if data[..4] != SNAPSHOT_MAGIC {
        return Err(CoreError::snapshot_corruption("invalid magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > SNAPSHOT_VERSION {
        return Err(CoreError::snapshot_corruption(format!("unsupported version {version}")));
    }
    let stored = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
    let body = &data[HEADER_SIZE..];
    let computed = crc32(body);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let malformed = || CoreError::snapshot_corruption("unexpected structure");
    let root = thaw(body)?;
    let mut entries = Vec::new();
    for (type_name, names) in root.as_map().ok_or_else(malformed)? {
        let type_name = TypeName::from(type_name.as_text().ok_or_else(malformed)?);
        for (name, frozen) in names.as_map().ok_or_else(malformed)? {
            let name = name.as_text().ok_or_else(malformed)?;
            let frozen = frozen.as_bytes().ok_or_else(malformed)?;
            entries.push((EntityKey::new(type_name.clone(), name), frozen.to_vec()));
        }
    }
    Ok(entries)
}
