// Block mapping: old document positions -> new document positions.
//
// A batch of structural transforms (one per old block) is compiled once per
// edit transaction into a `BlockMapping`. Queries are pure and cheap; the
// mapping is never persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod delta;
pub mod diff;
pub mod verify;

use delta::DeltaIndex;

pub use diff::{deltas_from_text_diff, transform_from_texts};
pub use verify::{
    verify_coverage, verify_determinism, verify_locality, verify_monotonicity, MappingViolation,
};

/// Code carried by range violations, shared with other coordinate checks.
pub const INVALID_RANGE_CODE: &str = "INV-COORD-002";

/// A single text edit inside a block. Positive `delta` inserts that many
/// chars at `offset`; negative deletes `|delta|` chars starting at `offset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionDelta {
    pub block_id: String,
    pub offset: usize,
    pub delta: i64,
}

impl PositionDelta {
    pub fn insert(block_id: impl Into<String>, offset: usize, len: usize) -> Self {
        Self { block_id: block_id.into(), offset, delta: len as i64 }
    }

    pub fn delete(block_id: impl Into<String>, offset: usize, len: usize) -> Self {
        Self { block_id: block_id.into(), offset, delta: -(len as i64) }
    }
}

/// What happened to one (or, for merges, several) old blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockTransform {
    Unchanged { old_id: String, new_id: String },
    Modified { old_id: String, new_id: String, deltas: Vec<PositionDelta> },
    /// Offsets `< split_at` stay in `new_ids[0]`; the rest move to `new_ids[1]`.
    Split { old_id: String, new_ids: Vec<String>, split_at: usize },
    /// Old blocks are concatenated in `old_ids` order into `new_id`.
    Merged { old_ids: Vec<String>, old_lengths: Vec<usize>, new_id: String },
    Deleted { old_id: String },
}

impl BlockTransform {
    pub fn old_ids(&self) -> Vec<&str> {
        match self {
            Self::Unchanged { old_id, .. }
            | Self::Modified { old_id, .. }
            | Self::Split { old_id, .. }
            | Self::Deleted { old_id } => vec![old_id.as_str()],
            Self::Merged { old_ids, .. } => old_ids.iter().map(String::as_str).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unchanged { .. } => "unchanged",
            Self::Modified { .. } => "modified",
            Self::Split { .. } => "split",
            Self::Merged { .. } => "merged",
            Self::Deleted { .. } => "deleted",
        }
    }
}

/// A mapped position in the new document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MappedPosition {
    pub new_block_id: String,
    pub new_abs_in_block: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MappingOptions<'a> {
    /// Current text of the old blocks; enables range validation.
    pub block_texts: Option<&'a HashMap<String, String>>,
    /// Run the monotonicity and locality checkers over every block with
    /// known text while building.
    pub verify_invariants: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockRoute {
    Identity { new_id: String },
    Shifted { new_id: String, index: DeltaIndex },
    Split { split_at: usize, left: String, right: String },
    Merged { new_id: String, base: usize },
    Deleted,
}

/// Compiled old-block-id -> new-position function.
#[derive(Debug, Clone, Default)]
pub struct BlockMapping {
    routes: HashMap<String, BlockRoute>,
    derived: HashMap<String, Vec<String>>,
}

impl BlockMapping {
    /// Map an old `(block, offset)` to the new document. `None` if the
    /// position was deleted or the block has no transform in this batch.
    pub fn map_old_to_new(&self, block_id: &str, offset: usize) -> Option<MappedPosition> {
        let position = |new_id: &str, abs: usize| MappedPosition {
            new_block_id: new_id.to_string(),
            new_abs_in_block: abs,
        };

        match self.routes.get(block_id)? {
            BlockRoute::Identity { new_id } => Some(position(new_id, offset)),
            BlockRoute::Shifted { new_id, index } => {
                index.map(offset).map(|abs| position(new_id, abs))
            }
            BlockRoute::Split { split_at, left, right } => {
                if offset < *split_at {
                    Some(position(left, offset))
                } else {
                    Some(position(right, offset - split_at))
                }
            }
            BlockRoute::Merged { new_id, base } => Some(position(new_id, base + offset)),
            BlockRoute::Deleted => None,
        }
    }

    /// New blocks that carry content of `old_block_id`, in document order.
    pub fn derived_blocks_from(&self, old_block_id: &str) -> &[String] {
        self.derived.get(old_block_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, old_block_id: &str) -> bool {
        self.routes.contains_key(old_block_id)
    }

    /// Whether the old position is covered by a deletion (whole block or range).
    pub fn is_deleted(&self, block_id: &str, offset: usize) -> bool {
        match self.routes.get(block_id) {
            Some(BlockRoute::Deleted) => true,
            Some(BlockRoute::Shifted { index, .. }) => index.is_deleted(offset),
            _ => false,
        }
    }

    /// Smallest old offset the block's edits touch. `Some(0)` for routes that
    /// relocate the whole block; `None` for identity routes.
    pub fn first_affected_offset(&self, block_id: &str) -> Option<usize> {
        match self.routes.get(block_id)? {
            BlockRoute::Identity { .. } => None,
            BlockRoute::Shifted { index, .. } => index.first_edit_offset(),
            BlockRoute::Split { split_at, .. } => Some(*split_at),
            BlockRoute::Merged { base, .. } => (*base > 0).then_some(0),
            BlockRoute::Deleted => Some(0),
        }
    }

    pub fn old_block_ids(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Net `(inserted, deleted)` char counts for a modified block.
    pub fn edit_totals(&self, block_id: &str) -> Option<(usize, usize)> {
        match self.routes.get(block_id)? {
            BlockRoute::Shifted { index, .. } => {
                Some((index.total_inserted(), index.total_deleted()))
            }
            _ => None,
        }
    }
}

/// Compile a batch of transforms into a `BlockMapping`.
///
/// With `block_texts`, every offset is range-checked against the actual old
/// text; a violation means the caller described an impossible edit and is
/// returned as `MappingError::InvalidRange`, never tolerated.
pub fn create_block_mapping(
    transforms: &[BlockTransform],
    options: &MappingOptions<'_>,
) -> Result<BlockMapping, MappingError> {
    let mut mapping = BlockMapping::default();

    for transform in transforms {
        if let Some(texts) = options.block_texts {
            assert_valid_range(transform, texts)?;
        }

        match transform {
            BlockTransform::Unchanged { old_id, new_id } => {
                mapping.insert(old_id, BlockRoute::Identity { new_id: new_id.clone() })?;
                mapping.derive(old_id, new_id);
            }
            BlockTransform::Modified { old_id, new_id, deltas } => {
                if let Some(foreign) = deltas.iter().find(|d| d.block_id != *old_id) {
                    return Err(MappingError::ForeignDelta {
                        block_id: old_id.clone(),
                        delta_block_id: foreign.block_id.clone(),
                    });
                }
                let index = DeltaIndex::build(deltas);
                mapping.insert(old_id, BlockRoute::Shifted { new_id: new_id.clone(), index })?;
                mapping.derive(old_id, new_id);
            }
            BlockTransform::Split { old_id, new_ids, split_at } => {
                let [left, right] = new_ids.as_slice() else {
                    return Err(MappingError::MalformedTransform {
                        block_id: old_id.clone(),
                        detail: format!("split needs exactly 2 new ids, got {}", new_ids.len()),
                    });
                };
                mapping.insert(
                    old_id,
                    BlockRoute::Split {
                        split_at: *split_at,
                        left: left.clone(),
                        right: right.clone(),
                    },
                )?;
                mapping.derive(old_id, left);
                mapping.derive(old_id, right);
            }
            BlockTransform::Merged { old_ids, old_lengths, new_id } => {
                if old_ids.len() != old_lengths.len() {
                    return Err(MappingError::MalformedTransform {
                        block_id: new_id.clone(),
                        detail: format!(
                            "merge lists {} old ids but {} lengths",
                            old_ids.len(),
                            old_lengths.len()
                        ),
                    });
                }
                let mut base = 0usize;
                for (old_id, len) in old_ids.iter().zip(old_lengths) {
                    mapping.insert(old_id, BlockRoute::Merged { new_id: new_id.clone(), base })?;
                    mapping.derive(old_id, new_id);
                    base += len;
                }
            }
            BlockTransform::Deleted { old_id } => {
                mapping.insert(old_id, BlockRoute::Deleted)?;
                mapping.derived.entry(old_id.clone()).or_default();
            }
        }
    }

    if options.verify_invariants {
        if let Some(texts) = options.block_texts {
            verify_with_texts(&mapping, texts)?;
        }
    }

    Ok(mapping)
}

impl BlockMapping {
    fn insert(&mut self, old_id: &str, route: BlockRoute) -> Result<(), MappingError> {
        if self.routes.contains_key(old_id) {
            return Err(MappingError::DuplicateBlock(old_id.to_string()));
        }
        self.routes.insert(old_id.to_string(), route);
        Ok(())
    }

    fn derive(&mut self, old_id: &str, new_id: &str) {
        let derived = self.derived.entry(old_id.to_string()).or_default();
        if !derived.iter().any(|existing| existing == new_id) {
            derived.push(new_id.to_string());
        }
    }
}

fn verify_with_texts(
    mapping: &BlockMapping,
    texts: &HashMap<String, String>,
) -> Result<(), MappingError> {
    let mut ids: Vec<&String> = texts.keys().filter(|id| mapping.contains(id)).collect();
    ids.sort();
    for block_id in ids {
        let len = texts[block_id].chars().count();
        verify_monotonicity(mapping, block_id, len)?;
        verify_locality(mapping, block_id, len)?;
    }
    Ok(())
}

/// Range-check a transform against the old block texts it describes.
///
/// Blocks without a known text are skipped.
pub fn assert_valid_range(
    transform: &BlockTransform,
    texts: &HashMap<String, String>,
) -> Result<(), MappingError> {
    let text_len = |id: &str| texts.get(id).map(|text| text.chars().count());

    match transform {
        BlockTransform::Modified { old_id, deltas, .. } => {
            let Some(len) = text_len(old_id) else { return Ok(()) };
            for delta in deltas {
                if delta.offset > len {
                    return Err(invalid_range(
                        old_id,
                        format!("delta offset {} exceeds block length {len}", delta.offset),
                    ));
                }
                if delta.delta < 0 {
                    let end = delta.offset + delta.delta.unsigned_abs() as usize;
                    if end > len {
                        return Err(invalid_range(
                            old_id,
                            format!(
                                "deletion [{}, {end}) exceeds block length {len}",
                                delta.offset
                            ),
                        ));
                    }
                }
            }
        }
        BlockTransform::Split { old_id, split_at, .. } => {
            if let Some(len) = text_len(old_id) {
                if *split_at > len {
                    return Err(invalid_range(
                        old_id,
                        format!("split offset {split_at} exceeds block length {len}"),
                    ));
                }
            }
        }
        BlockTransform::Merged { old_ids, old_lengths, .. } => {
            for (old_id, declared) in old_ids.iter().zip(old_lengths) {
                if let Some(len) = text_len(old_id) {
                    if *declared != len {
                        return Err(invalid_range(
                            old_id,
                            format!("merge declares length {declared}, block has {len}"),
                        ));
                    }
                }
            }
        }
        BlockTransform::Unchanged { .. } | BlockTransform::Deleted { .. } => {}
    }

    Ok(())
}

fn invalid_range(block_id: &str, detail: String) -> MappingError {
    debug!(%block_id, %detail, "rejected out-of-range block transform");
    MappingError::InvalidRange { block_id: block_id.to_string(), detail }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("INV-COORD-002: block {block_id}: {detail}")]
    InvalidRange { block_id: String, detail: String },
    #[error("block {0} has more than one transform in the batch")]
    DuplicateBlock(String),
    #[error("malformed transform for block {block_id}: {detail}")]
    MalformedTransform { block_id: String, detail: String },
    #[error("transform for block {block_id} carries a delta for block {delta_block_id}")]
    ForeignDelta { block_id: String, delta_block_id: String },
    #[error(transparent)]
    Violation(#[from] MappingViolation),
}

impl MappingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRange { .. } => INVALID_RANGE_CODE,
            Self::DuplicateBlock(_) => "DUPLICATE_BLOCK_TRANSFORM",
            Self::MalformedTransform { .. } => "MALFORMED_BLOCK_TRANSFORM",
            Self::ForeignDelta { .. } => "FOREIGN_POSITION_DELTA",
            Self::Violation(_) => "MAPPING_INVARIANT_VIOLATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(transforms: &[BlockTransform]) -> BlockMapping {
        create_block_mapping(transforms, &MappingOptions::default()).expect("mapping should build")
    }

    fn mapped(mapping: &BlockMapping, block: &str, offset: usize) -> Option<(String, usize)> {
        mapping
            .map_old_to_new(block, offset)
            .map(|p| (p.new_block_id, p.new_abs_in_block))
    }

    fn texts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(id, text)| (id.to_string(), text.to_string())).collect()
    }

    // ── per-kind routing ───────────────────────────────────────────

    #[test]
    fn unchanged_is_identity_to_new_id() {
        let mapping = build(&[BlockTransform::Unchanged {
            old_id: "b1".into(),
            new_id: "b1".into(),
        }]);
        assert_eq!(mapped(&mapping, "b1", 7), Some(("b1".into(), 7)));
        assert_eq!(mapping.derived_blocks_from("b1"), ["b1".to_string()]);
    }

    #[test]
    fn modified_applies_deltas() {
        let mapping = build(&[BlockTransform::Modified {
            old_id: "b1".into(),
            new_id: "b1".into(),
            deltas: vec![PositionDelta::insert("b1", 0, 3), PositionDelta::delete("b1", 5, 2)],
        }]);
        assert_eq!(mapped(&mapping, "b1", 0), Some(("b1".into(), 3)));
        assert_eq!(mapped(&mapping, "b1", 5), None);
        assert_eq!(mapped(&mapping, "b1", 7), Some(("b1".into(), 8)));
        assert_eq!(mapping.edit_totals("b1"), Some((3, 2)));
    }

    #[test]
    fn split_routes_by_offset() {
        let mapping = build(&[BlockTransform::Split {
            old_id: "b1".into(),
            new_ids: vec!["b1".into(), "b1-tail".into()],
            split_at: 6,
        }]);
        assert_eq!(mapped(&mapping, "b1", 5), Some(("b1".into(), 5)));
        assert_eq!(mapped(&mapping, "b1", 6), Some(("b1-tail".into(), 0)));
        assert_eq!(mapped(&mapping, "b1", 9), Some(("b1-tail".into(), 3)));
        assert_eq!(mapping.derived_blocks_from("b1"), ["b1".to_string(), "b1-tail".to_string()]);
    }

    #[test]
    fn merged_offsets_by_cumulative_length() {
        let mapping = build(&[BlockTransform::Merged {
            old_ids: vec!["a".into(), "b".into(), "c".into()],
            old_lengths: vec![4, 10, 2],
            new_id: "abc".into(),
        }]);
        assert_eq!(mapped(&mapping, "a", 1), Some(("abc".into(), 1)));
        assert_eq!(mapped(&mapping, "b", 0), Some(("abc".into(), 4)));
        assert_eq!(mapped(&mapping, "c", 2), Some(("abc".into(), 16)));
    }

    #[test]
    fn deleted_always_maps_to_none() {
        let mapping = build(&[BlockTransform::Deleted { old_id: "gone".into() }]);
        assert_eq!(mapped(&mapping, "gone", 0), None);
        assert!(mapping.is_deleted("gone", 3));
        assert!(mapping.derived_blocks_from("gone").is_empty());
    }

    #[test]
    fn unknown_block_maps_to_none() {
        let mapping = build(&[]);
        assert_eq!(mapped(&mapping, "nope", 0), None);
        assert!(mapping.derived_blocks_from("nope").is_empty());
    }

    // ── batch validation ───────────────────────────────────────────

    #[test]
    fn duplicate_old_block_is_rejected() {
        let error = create_block_mapping(
            &[
                BlockTransform::Deleted { old_id: "b1".into() },
                BlockTransform::Unchanged { old_id: "b1".into(), new_id: "b1".into() },
            ],
            &MappingOptions::default(),
        )
        .expect_err("duplicate should fail");
        assert_eq!(error, MappingError::DuplicateBlock("b1".into()));
    }

    #[test]
    fn split_needs_two_ids() {
        let error = create_block_mapping(
            &[BlockTransform::Split { old_id: "b1".into(), new_ids: vec!["x".into()], split_at: 0 }],
            &MappingOptions::default(),
        )
        .expect_err("split with one id should fail");
        assert!(matches!(error, MappingError::MalformedTransform { .. }));
    }

    #[test]
    fn foreign_delta_is_rejected() {
        let error = create_block_mapping(
            &[BlockTransform::Modified {
                old_id: "b1".into(),
                new_id: "b1".into(),
                deltas: vec![PositionDelta::insert("b2", 0, 1)],
            }],
            &MappingOptions::default(),
        )
        .expect_err("foreign delta should fail");
        assert_eq!(error.code(), "FOREIGN_POSITION_DELTA");
    }

    // ── range validation ───────────────────────────────────────────

    #[test]
    fn deletion_past_end_is_invalid_range() {
        let block_texts = texts(&[("b1", "hello")]);
        let error = create_block_mapping(
            &[BlockTransform::Modified {
                old_id: "b1".into(),
                new_id: "b1".into(),
                deltas: vec![PositionDelta::delete("b1", 3, 5)],
            }],
            &MappingOptions { block_texts: Some(&block_texts), verify_invariants: false },
        )
        .expect_err("range should be rejected");

        assert_eq!(error.code(), INVALID_RANGE_CODE);
        assert!(error.to_string().starts_with("INV-COORD-002: block b1"));
    }

    #[test]
    fn split_past_end_is_invalid_range() {
        let block_texts = texts(&[("b1", "abc")]);
        let error = create_block_mapping(
            &[BlockTransform::Split {
                old_id: "b1".into(),
                new_ids: vec!["l".into(), "r".into()],
                split_at: 4,
            }],
            &MappingOptions { block_texts: Some(&block_texts), verify_invariants: false },
        )
        .expect_err("split should be rejected");
        assert_eq!(error.code(), INVALID_RANGE_CODE);
    }

    #[test]
    fn merge_length_must_match_text() {
        let block_texts = texts(&[("a", "four"), ("b", "xy")]);
        let error = create_block_mapping(
            &[BlockTransform::Merged {
                old_ids: vec!["a".into(), "b".into()],
                old_lengths: vec![4, 3],
                new_id: "ab".into(),
            }],
            &MappingOptions { block_texts: Some(&block_texts), verify_invariants: false },
        )
        .expect_err("merge should be rejected");
        assert!(matches!(error, MappingError::InvalidRange { ref block_id, .. } if block_id == "b"));
    }

    #[test]
    fn ranges_count_chars_not_bytes() {
        let block_texts = texts(&[("b1", "🙂🙂🙂")]);
        let mapping = create_block_mapping(
            &[BlockTransform::Modified {
                old_id: "b1".into(),
                new_id: "b1".into(),
                deltas: vec![PositionDelta::delete("b1", 1, 2)],
            }],
            &MappingOptions { block_texts: Some(&block_texts), verify_invariants: true },
        )
        .expect("char-based range should be valid");
        assert_eq!(mapped(&mapping, "b1", 3), Some(("b1".into(), 1)));
    }

    #[test]
    fn verified_build_accepts_consistent_batch() {
        let block_texts = texts(&[("a", "alpha"), ("b", "beta gamma")]);
        let result = create_block_mapping(
            &[
                BlockTransform::Modified {
                    old_id: "a".into(),
                    new_id: "a".into(),
                    deltas: vec![PositionDelta::insert("a", 2, 4)],
                },
                BlockTransform::Split {
                    old_id: "b".into(),
                    new_ids: vec!["b".into(), "b2".into()],
                    split_at: 5,
                },
            ],
            &MappingOptions { block_texts: Some(&block_texts), verify_invariants: true },
        );
        assert!(result.is_ok());
    }

    #[test]
    fn transform_serializes_with_kind_tag() {
        let json = serde_json::to_value(BlockTransform::Deleted { old_id: "b9".into() }).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "deleted", "old_id": "b9" }));
    }
}
