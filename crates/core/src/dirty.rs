// Dirty-region calculation after a user edit.
//
// Given the blocks an edit touched and the op codes it applied, decides
// which blocks consumers must re-verify. With a document order, each touched
// block pulls in `k` neighbors on each side, where `k` grows with list and
// table nesting:
//
//   k = neighbor_expand_k + list_depth * list_depth_bonus + table_depth * table_depth_bonus
//
// capped at `max_adaptive_k`. Without an order, structural edits set
// `neighbors_pending` so the consumer resolves neighbors itself.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    InsertText,
    DeleteText,
    FormatText,
    SetBlockAttrs,
    InsertBlock,
    DeleteBlock,
    SplitBlock,
    MergeBlock,
    MoveBlock,
}

impl OpCode {
    /// Split, merge and move change block adjacency.
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::SplitBlock | Self::MergeBlock | Self::MoveBlock)
    }
}

/// Half-open char range touched inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchedRange {
    pub start: usize,
    pub end: usize,
}

impl TouchedRange {
    fn cover(self, other: TouchedRange) -> TouchedRange {
        TouchedRange { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNesting {
    #[serde(default)]
    pub list_depth: usize,
    #[serde(default)]
    pub table_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchedBlock {
    pub block_id: String,
    /// `None` marks the whole block dirty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<TouchedRange>,
    #[serde(default)]
    pub nesting: BlockNesting,
}

impl TouchedBlock {
    pub fn whole(block_id: impl Into<String>) -> Self {
        Self { block_id: block_id.into(), range: None, nesting: BlockNesting::default() }
    }

    pub fn range(block_id: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            block_id: block_id.into(),
            range: Some(TouchedRange { start, end }),
            nesting: BlockNesting::default(),
        }
    }

    pub fn nested(mut self, list_depth: usize, table_depth: usize) -> Self {
        self.nesting = BlockNesting { list_depth, table_depth };
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSummary {
    pub touched_blocks: Vec<TouchedBlock>,
    #[serde(default)]
    pub op_codes: Vec<OpCode>,
}

impl EditSummary {
    pub fn has_structural_ops(&self) -> bool {
        self.op_codes.iter().any(|op| op.is_structural())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NeighborExpansionPolicy {
    pub neighbor_expand_k: usize,
    pub max_adaptive_k: Option<usize>,
    pub list_depth_bonus: Option<usize>,
    pub table_depth_bonus: Option<usize>,
}

impl Default for NeighborExpansionPolicy {
    fn default() -> Self {
        Self { neighbor_expand_k: 1, max_adaptive_k: None, list_depth_bonus: None, table_depth_bonus: None }
    }
}

impl NeighborExpansionPolicy {
    /// Neighbors to pull in on each side of a block with this nesting.
    pub fn k_for(&self, nesting: BlockNesting) -> usize {
        let base = self.neighbor_expand_k;
        let bonus = nesting.list_depth * self.list_depth_bonus.unwrap_or(0)
            + nesting.table_depth * self.table_depth_bonus.unwrap_or(0);
        let k = base + bonus;
        match self.max_adaptive_k {
            Some(max) => k.min(max.max(base)),
            None => k,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyOptions<'a> {
    pub order: Option<&'a [String]>,
    pub neighbor_policy: Option<&'a NeighborExpansionPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyInfo {
    /// Touched blocks, deduplicated in first-seen order.
    pub touched_block_ids: Vec<String>,
    /// Blocks to re-verify, in document order when an order was given.
    pub expanded_block_ids: Vec<String>,
    /// Covering range per touched block; `None` means the whole block.
    pub blocks: BTreeMap<String, Option<TouchedRange>>,
    /// Structural edit without a document order: neighbors still unknown.
    #[serde(default)]
    pub neighbors_pending: bool,
}

pub fn compute_dirty_info(summary: &EditSummary, options: DirtyOptions<'_>) -> DirtyInfo {
    let mut touched_block_ids = Vec::new();
    let mut blocks: BTreeMap<String, Option<TouchedRange>> = BTreeMap::new();

    for touched in &summary.touched_blocks {
        match blocks.get_mut(&touched.block_id) {
            Some(existing) => {
                *existing = match (*existing, touched.range) {
                    (Some(current), Some(next)) => Some(current.cover(next)),
                    _ => None,
                };
            }
            None => {
                touched_block_ids.push(touched.block_id.clone());
                blocks.insert(touched.block_id.clone(), touched.range);
            }
        }
    }

    let default_policy = NeighborExpansionPolicy::default();
    let policy = options.neighbor_policy.unwrap_or(&default_policy);
    let structural = summary.has_structural_ops();

    let (expanded_block_ids, neighbors_pending) = match options.order {
        Some(order) => (expand_touched_blocks(&summary.touched_blocks, order, policy), false),
        None => (touched_block_ids.clone(), structural),
    };

    debug!(
        touched = touched_block_ids.len(),
        expanded = expanded_block_ids.len(),
        structural,
        neighbors_pending,
        "computed dirty region"
    );

    DirtyInfo { touched_block_ids, expanded_block_ids, blocks, neighbors_pending }
}

/// Touched blocks plus their adaptive neighborhoods, in document order.
/// Touched blocks missing from `order` are appended at the end.
pub fn expand_touched_blocks(
    touched: &[TouchedBlock],
    order: &[String],
    policy: &NeighborExpansionPolicy,
) -> Vec<String> {
    let index: HashMap<&str, usize> =
        order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    // Widest k per block when a block is touched more than once.
    let mut radius: HashMap<usize, usize> = HashMap::new();
    let mut unordered: Vec<String> = Vec::new();
    for block in touched {
        let k = policy.k_for(block.nesting);
        match index.get(block.block_id.as_str()) {
            Some(&i) => {
                let entry = radius.entry(i).or_insert(k);
                *entry = (*entry).max(k);
            }
            None if !unordered.contains(&block.block_id) => unordered.push(block.block_id.clone()),
            None => {}
        }
    }

    let mut dirty: HashSet<usize> = HashSet::new();
    for (&i, &k) in &radius {
        let start = i.saturating_sub(k);
        let end = (i + k).min(order.len().saturating_sub(1));
        dirty.extend(start..=end);
    }

    let mut expanded: Vec<String> = order
        .iter()
        .enumerate()
        .filter(|(i, _)| dirty.contains(i))
        .map(|(_, id)| id.clone())
        .collect();
    expanded.extend(unordered);
    expanded
}
