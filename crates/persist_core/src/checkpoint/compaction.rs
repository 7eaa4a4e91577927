//! Folding committed records down to one per entity.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** change logical state
//! - The last record per key wins
//! - Tombstones are kept: an older checkpoint file may still hold the key

use crate::checkpoint::record::CheckpointRecord;
use crate::types::EntityKey;
use std::collections::HashMap;

/// Result of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Number of records in the input.
    pub input_records: usize,
    /// Number of records in the output.
    pub output_records: usize,
    /// Tombstones in the output.
    pub tombstones: usize,
    /// Number of superseded versions removed.
    pub obsolete_versions_removed: usize,
    /// Input size minus output size, encoded.
    pub bytes_saved: usize,
}

/// Keeps the last record per key, in key order.
#[must_use]
pub fn compact(records: Vec<CheckpointRecord>) -> (Vec<CheckpointRecord>, CompactionStats) {
    let input_records = records.len();
    let input_size: usize = records.iter().map(CheckpointRecord::encoded_size).sum();

    let mut latest: HashMap<EntityKey, CheckpointRecord> = HashMap::with_capacity(records.len());
    let mut obsolete = 0usize;
    for record in records {
        if latest.insert(record.key.clone(), record).is_some() {
            obsolete += 1;
        }
    }

    let mut output: Vec<CheckpointRecord> = latest.into_values().collect();
    output.sort_by(|a, b| a.key.cmp(&b.key));

    let output_size: usize = output.iter().map(CheckpointRecord::encoded_size).sum();
    let stats = CompactionStats {
        input_records,
        output_records: output.len(),
        tombstones: output.iter().filter(|r| r.is_tombstone()).count(),
        obsolete_versions_removed: obsolete,
        bytes_saved: input_size.saturating_sub(output_size),
    };
    (output, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> EntityKey {
        EntityKey::new("Integer", name)
    }

    #[test]
    fn empty_input() {
        let (out, stats) = compact(Vec::new());
        assert!(out.is_empty());
        assert_eq!(stats, CompactionStats::default());
    }

    #[test]
    fn last_write_wins_and_tombstones_survive() {
        let records = vec![
            CheckpointRecord::put(key("x"), vec![1]),
            CheckpointRecord::put(key("y"), vec![2]),
            CheckpointRecord::put(key("x"), vec![3]),
            CheckpointRecord::tombstone(key("y")),
        ];
        let (out, stats) = compact(records);
        assert_eq!(
            out,
            vec![
                CheckpointRecord::put(key("x"), vec![3]),
                CheckpointRecord::tombstone(key("y")),
            ]
        );
        assert_eq!(stats.input_records, 4);
        assert_eq!(stats.output_records, 2);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.obsolete_versions_removed, 2);
        assert!(stats.bytes_saved > 0);
    }

    #[test]
    fn same_name_different_types_are_distinct() {
        let records = vec![
            CheckpointRecord::put(EntityKey::new("Integer", "x"), vec![1]),
            CheckpointRecord::put(EntityKey::new("Text", "x"), vec![2]),
        ];
        assert_eq!(compact(records).0.len(), 2);
    }

    fn arb_record() -> impl Strategy<Value = CheckpointRecord> {
        (0u8..6, proptest::option::of(proptest::collection::vec(any::<u8>(), 0..8))).prop_map(
            |(n, value)| CheckpointRecord {
                key: key(&format!("k{n}")),
                value,
            },
        )
    }

    proptest! {
        #[test]
        fn compaction_keeps_last_write(records in proptest::collection::vec(arb_record(), 0..40)) {
            let mut expected: HashMap<EntityKey, Option<Vec<u8>>> = HashMap::new();
            for r in &records {
                expected.insert(r.key.clone(), r.value.clone());
            }

            let (out, stats) = compact(records);
            prop_assert_eq!(out.len(), expected.len());
            prop_assert_eq!(stats.output_records, expected.len());
            for r in &out {
                prop_assert_eq!(expected.get(&r.key), Some(&r.value));
            }
            prop_assert!(out.windows(2).all(|w| w[0].key < w[1].key));
        }
    }
}
