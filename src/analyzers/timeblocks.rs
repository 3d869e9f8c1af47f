//! Proportion results for every partial combination of time blocks.

use crate::analyzers::types::{Cell, Column, ColumnRole, Table};
use crate::error::{Result, ValidationError};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Column that tags each row of a sweep with its combination label.
pub const TIME_GROUP_COLUMN: &str = "time_group";

/// A subset of time blocks and its canonical label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBlockGroup {
    pub label: String,
    pub blocks: BTreeSet<String>,
}

impl TimeBlockGroup {
    /// Labels are the blocks sorted and concatenated, so any ordering of the
    /// same blocks yields the same label.
    pub fn new<S: AsRef<str>>(blocks: &[S]) -> Self {
        let blocks: BTreeSet<String> = blocks.iter().map(|b| b.as_ref().to_string()).collect();
        TimeBlockGroup {
            label: blocks.iter().map(String::as_str).collect(),
            blocks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeBlockCombiner {
    blocks: Vec<String>,
}

impl TimeBlockCombiner {
    pub fn new(blocks: Vec<String>) -> Self {
        TimeBlockCombiner { blocks }
    }

    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    /// Every subset of size 2 through k-1.
    ///
    /// Singletons and the full set are left out; they are served by the
    /// per-block and all-blocks tables.
    pub fn combinations(&self) -> Vec<TimeBlockGroup> {
        let k = self.blocks.len();
        let mut out = Vec::new();
        if k < 3 {
            return out;
        }

        for mask in 1u32..(1 << k) - 1 {
            let size = mask.count_ones() as usize;
            if size < 2 {
                continue;
            }
            let subset: Vec<&str> = (0..k)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| self.blocks[i].as_str())
                .collect();
            out.push(TimeBlockGroup::new(&subset));
        }

        out.sort_by(|a, b| {
            a.blocks
                .len()
                .cmp(&b.blocks.len())
                .then_with(|| a.label.cmp(&b.label))
        });
        out
    }

    /// Runs `pipeline` once per combination and concatenates the results,
    /// each row tagged with its combination label in [`TIME_GROUP_COLUMN`].
    #[tracing::instrument(skip(self, pipeline), fields(blocks = self.blocks.len()))]
    pub fn sweep<F>(&self, mut pipeline: F) -> Result<Table>
    where
        F: FnMut(&BTreeSet<String>) -> Result<Table>,
    {
        let mut combined = Table::default();
        let groups = self.combinations();

        for group in &groups {
            let mut table = pipeline(&group.blocks)?;
            debug!(label = %group.label, rows = table.len(), "Time group computed");
            table.prepend_constant(
                Column::new(TIME_GROUP_COLUMN, ColumnRole::Key),
                Cell::text(group.label.clone()),
            );
            combined.append(table)?;
        }

        info!(groups = groups.len(), rows = combined.len(), "Time group sweep complete");
        Ok(combined)
    }
}

/// Which precomputed table a caller's block selection points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelection {
    AllBlocks,
    Single(String),
    /// Label of a row set in the sweep table.
    Combination(String),
}

impl BlockSelection {
    /// Resolves a user selection. `All` on its own, or every block, selects
    /// the all-blocks table.
    pub fn resolve<S: AsRef<str>>(selected: &[S], blocks: &[String]) -> Result<Self> {
        let chosen: BTreeSet<&str> = selected.iter().map(AsRef::as_ref).collect();
        if chosen.is_empty() {
            return Err(ValidationError::EmptyList.into());
        }
        if chosen.len() == 1 && chosen.contains("All") {
            return Ok(BlockSelection::AllBlocks);
        }

        let unknown: Vec<String> = chosen
            .iter()
            .filter(|b| !blocks.iter().any(|k| k == *b))
            .map(|b| b.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::UnmappedCodes {
                mapping: TIME_GROUP_COLUMN.to_string(),
                codes: unknown,
            }
            .into());
        }

        Ok(match chosen.len() {
            n if n == blocks.len() => BlockSelection::AllBlocks,
            1 => BlockSelection::Single(chosen.iter().map(|b| b.to_string()).collect()),
            _ => BlockSelection::Combination(TimeBlockGroup::new(&Vec::from_iter(chosen)).label),
        })
    }
}
