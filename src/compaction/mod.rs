//! Compaction — background merging of SSTables.
//!
//! Compaction keeps the table count bounded and reclaims space held by
//! shadowed versions and spent tombstones. It runs in two phases that this
//! module keeps strictly separate:
//!
//! 1. **Planning** ([`plan`]) — pure selection over table metadata. Three
//!    strategies ([`CompactionStrategyKind`]):
//!    - *size-tiered*: tables of similar size (within a factor of two)
//!      form buckets; a bucket with enough members is merged.
//!    - *leveled*: L0 merges into L1 once it holds enough tables; a
//!      deeper level merges into the next when its bytes overflow a
//!      multiple of the level above it.
//!    - *hybrid*: size-tiered bucketing inside L0 (output to L1),
//!      leveled from L1 down.
//! 2. **Execution** ([`execute`]) — k-way merge of the selected inputs in
//!    `(key ASC, seq DESC)` order, keeping the highest-sequence version
//!    of each key, then an atomic build + manifest update.
//!
//! # Tombstone policy
//!
//! A tombstone may be dropped only when the merge inputs include every
//! table that could still hold an older version of its key — otherwise
//! deleted data would resurface. Concretely: every live table *outside*
//! the inputs must sit at a shallower level than every input (shallower
//! tables are strictly newer). A full compaction always qualifies.
//!
//! # Crash safety
//!
//! The output is built under a `.tmp` name and renamed before the
//! manifest adopts it; a crash at any point leaves the inputs live and at
//! worst an orphan file that startup deletes.

mod leveled;
mod size_tiered;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{CompactionStrategyKind, EngineConfig};
use crate::engine::utils::{MergeIterator, Record};
use crate::manifest::{Manifest, ManifestError, ManifestTable};
use crate::sstable::{SsTable, SsTableError, SstWriteOptions, SstWriter};

/// How many times larger a level may grow than the level above it before
/// it overflows (leveled strategy).
pub(crate) const LEVEL_GROWTH_FACTOR: u64 = 10;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SsTable(#[from] SsTableError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Planning types
// ------------------------------------------------------------------------------------------------

/// Metadata the planner sees for one live table.
#[derive(Debug, Clone, Copy)]
pub struct TableMeta {
    pub id: u64,
    pub level: u32,
    pub bytes: u64,
}

/// A selected compaction: which tables to merge, where the output lands,
/// and whether tombstones may be garbage-collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    pub inputs: Vec<u64>,
    pub target_level: u32,
    pub drop_tombstones: bool,
}

/// Selects a compaction under the configured strategy, or `None` when no
/// trigger condition holds. Planning never touches the filesystem.
pub fn plan(tables: &[TableMeta], config: &EngineConfig) -> Option<CompactionPlan> {
    let selected = match config.compaction_strategy {
        CompactionStrategyKind::SizeTiered => size_tiered::plan(tables, config),
        CompactionStrategyKind::Leveled => leveled::plan(tables, config),
        CompactionStrategyKind::Hybrid => {
            // Size-tiered grouping within L0 (output moves to L1), leveled
            // for everything deeper.
            let level0: Vec<TableMeta> = tables.iter().filter(|t| t.level == 0).copied().collect();
            size_tiered::plan_bucket(&level0, config)
                .map(|inputs| Selection {
                    inputs,
                    target_level: 1,
                })
                .or_else(|| leveled::plan_deep_levels(tables, config))
        }
    }?;

    let drop_tombstones = may_drop_tombstones(&selected.inputs, tables);
    Some(CompactionPlan {
        inputs: selected.inputs,
        target_level: selected.target_level,
        drop_tombstones,
    })
}

/// Produces a plan covering **all** live tables — the explicit full
/// compaction. Tombstones are always droppable here.
pub fn plan_full(tables: &[TableMeta]) -> Option<CompactionPlan> {
    if tables.len() < 2 {
        return None;
    }
    let bottom = tables.iter().map(|t| t.level).max().unwrap_or(0);
    Some(CompactionPlan {
        inputs: tables.iter().map(|t| t.id).collect(),
        target_level: bottom,
        drop_tombstones: true,
    })
}

/// Strategy-internal selection, before the tombstone policy is applied.
pub(crate) struct Selection {
    pub(crate) inputs: Vec<u64>,
    pub(crate) target_level: u32,
}

/// A tombstone may be dropped only when no table outside the inputs can
/// hold an older version of any input key. Tables at shallower levels
/// than every input are strictly newer, so the condition is: every
/// non-input table sits above the shallowest input level.
fn may_drop_tombstones(inputs: &[u64], tables: &[TableMeta]) -> bool {
    let min_input_level = tables
        .iter()
        .filter(|t| inputs.contains(&t.id))
        .map(|t| t.level)
        .min()
        .unwrap_or(0);

    tables
        .iter()
        .filter(|t| !inputs.contains(&t.id))
        .all(|t| t.level < min_input_level)
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Result of an executed compaction, to be applied to the readable set.
pub struct CompactionOutcome {
    /// Ids of the consumed tables (already removed from the manifest).
    pub removed: Vec<u64>,
    /// The merged output, already opened and manifest-registered. `None`
    /// when every record was eliminated.
    pub added: Option<AddedTable>,
}

/// A freshly published compaction output.
pub struct AddedTable {
    pub table: Arc<SsTable>,
    pub level: u32,
    pub max_seq: u64,
}

/// Merges the planned inputs into one output table and atomically adopts
/// it in the manifest.
///
/// Input *files* are not deleted here — the caller removes them after the
/// readable set has been swapped, so in-flight readers drain first.
pub fn execute(
    plan: &CompactionPlan,
    all_tables: &[Arc<SsTable>],
    sst_dir: &Path,
    manifest: &mut Manifest,
    write_opts: SstWriteOptions,
) -> Result<CompactionOutcome, CompactionError> {
    let inputs: Vec<Arc<SsTable>> = all_tables
        .iter()
        .filter(|t| plan.inputs.contains(&t.id))
        .cloned()
        .collect();

    debug!(
        input_count = inputs.len(),
        target_level = plan.target_level,
        drop_tombstones = plan.drop_tombstones,
        "compaction merge starting"
    );

    let iters: Vec<Box<dyn Iterator<Item = Record>>> = inputs
        .iter()
        .map(|t| Box::new(t.iter_from(b"")) as Box<dyn Iterator<Item = Record>>)
        .collect();
    let survivors = dedup_records(MergeIterator::new(iters), plan.drop_tombstones);

    if survivors.is_empty() {
        // Everything was shadowed or garbage-collected.
        manifest.apply_compaction(&plan.inputs, None)?;
        info!(removed = ?plan.inputs, "compaction eliminated all records");
        return Ok(CompactionOutcome {
            removed: plan.inputs.clone(),
            added: None,
        });
    }

    let new_id = manifest.allocate_sst_id();
    let path = sst_dir.join(format!("{new_id}.sst"));
    let count = survivors.len();
    let max_seq = survivors.iter().map(Record::seq).max().unwrap_or(0);
    SstWriter::new(&path, write_opts).build(survivors.into_iter(), count)?;

    let table = Arc::new(SsTable::open(&path, new_id)?);
    manifest.apply_compaction(
        &plan.inputs,
        Some(ManifestTable {
            id: new_id,
            level: plan.target_level,
            max_seq,
        }),
    )?;

    info!(
        new_id,
        records = count,
        removed = ?plan.inputs,
        target_level = plan.target_level,
        "compaction published"
    );

    Ok(CompactionOutcome {
        removed: plan.inputs.clone(),
        added: Some(AddedTable {
            table,
            level: plan.target_level,
            max_seq,
        }),
    })
}

/// Collapses a `(key ASC, seq DESC)` merge stream to one record per key —
/// the first (highest-sequence) one — optionally discarding tombstones.
pub(crate) fn dedup_records(
    merged: impl Iterator<Item = Record>,
    drop_tombstones: bool,
) -> Vec<Record> {
    let mut survivors = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;

    for record in merged {
        if last_key.as_deref() == Some(record.key()) {
            continue; // shadowed older version
        }
        last_key = Some(record.key().to_vec());

        if record.is_tombstone() && drop_tombstones {
            continue;
        }
        survivors.push(record);
    }

    survivors
}
