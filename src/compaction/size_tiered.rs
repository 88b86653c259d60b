//! Size-tiered selection — bucket tables of similar size, merge the
//! fullest bucket.
//!
//! Tables are sorted by size and greedily grouped so that everything in a
//! bucket stays within a factor of two of the bucket's smallest member.
//! The bucket with the most tables wins once it reaches the trigger
//! count; the merge is capped at `compaction_max_inputs` tables.

use crate::config::EngineConfig;

use super::{Selection, TableMeta};

/// Full size-tiered planning over every live table. Output stays at L0 —
/// pure size-tiering has no level structure.
pub(crate) fn plan(tables: &[TableMeta], config: &EngineConfig) -> Option<Selection> {
    plan_bucket(tables, config).map(|inputs| Selection {
        inputs,
        target_level: 0,
    })
}

/// Picks the best similarity bucket among `tables`, or `None` when no
/// bucket reaches `compaction_trigger_count`.
pub(crate) fn plan_bucket(tables: &[TableMeta], config: &EngineConfig) -> Option<Vec<u64>> {
    if tables.len() < config.compaction_trigger_count {
        return None;
    }

    let mut by_size: Vec<&TableMeta> = tables.iter().collect();
    by_size.sort_by_key(|t| t.bytes);

    let mut buckets: Vec<Vec<&TableMeta>> = Vec::new();
    for table in by_size {
        match buckets.last_mut() {
            // Within factor 2 of the bucket's smallest member.
            Some(bucket) if table.bytes <= bucket[0].bytes.max(1) * 2 => bucket.push(table),
            _ => buckets.push(vec![table]),
        }
    }

    let best = buckets
        .into_iter()
        .filter(|b| b.len() >= config.compaction_trigger_count)
        .max_by_key(Vec::len)?;

    Some(
        best.iter()
            .take(config.compaction_max_inputs)
            .map(|t| t.id)
            .collect(),
    )
}
