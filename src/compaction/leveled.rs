//! Leveled selection — L0 drains by count, deeper levels by byte overflow.
//!
//! L0 receives every flush, so its tables overlap freely; once
//! `compaction_trigger_count` of them pile up they all merge into L1.
//! From L1 down, a level overflows when its total bytes exceed
//! [`LEVEL_GROWTH_FACTOR`](super::LEVEL_GROWTH_FACTOR) times the bytes of
//! the level above it; the oldest tables of the overflowing level merge
//! into the next one. An empty upstream level exerts no pressure.

use std::collections::BTreeMap;

use crate::config::EngineConfig;

use super::{LEVEL_GROWTH_FACTOR, Selection, TableMeta};

/// Full leveled planning: L0 first, then the deeper levels.
pub(crate) fn plan(tables: &[TableMeta], config: &EngineConfig) -> Option<Selection> {
    let level0: Vec<&TableMeta> = tables.iter().filter(|t| t.level == 0).collect();
    if level0.len() >= config.compaction_trigger_count {
        // Oldest first, so the cap trims the newest tables and their data
        // keeps shadowing what moved down.
        let mut ids: Vec<u64> = level0.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        ids.truncate(config.compaction_max_inputs);
        return Some(Selection {
            inputs: ids,
            target_level: 1,
        });
    }

    plan_deep_levels(tables, config)
}

/// Byte-overflow check for L1 and deeper. Shared with the hybrid strategy,
/// which handles L0 its own way.
pub(crate) fn plan_deep_levels(tables: &[TableMeta], config: &EngineConfig) -> Option<Selection> {
    let mut level_bytes: BTreeMap<u32, u64> = BTreeMap::new();
    for table in tables {
        *level_bytes.entry(table.level).or_default() += table.bytes;
    }

    let deepest = *level_bytes.keys().next_back()?;
    for level in 1..=deepest {
        let upstream = level_bytes.get(&(level - 1)).copied().unwrap_or(0);
        let own = level_bytes.get(&level).copied().unwrap_or(0);
        if upstream == 0 || own <= upstream.saturating_mul(LEVEL_GROWTH_FACTOR) {
            continue;
        }

        let mut ids: Vec<u64> = tables
            .iter()
            .filter(|t| t.level == level)
            .map(|t| t.id)
            .collect();
        if ids.len() < 2 {
            continue; // a single oversized table gains nothing from rewriting
        }
        ids.sort_unstable();
        ids.truncate(config.compaction_max_inputs);
        return Some(Selection {
            inputs: ids,
            target_level: level + 1,
        });
    }

    None
}
