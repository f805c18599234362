// Property checkers for block mappings.
//
// Pure functions over a compiled mapping. Used as optional build-time
// assertions (`MappingOptions::verify_invariants`) and by the property tests.

use std::collections::HashMap;

use thiserror::Error;

use super::{create_block_mapping, BlockMapping, BlockTransform, MappingError, MappingOptions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingViolation {
    #[error(
        "monotonicity violated in block {block_id}: old {earlier} -> {earlier_new}, old {later} -> {later_new} (new block {new_block_id})"
    )]
    Monotonicity {
        block_id: String,
        new_block_id: String,
        earlier: usize,
        earlier_new: usize,
        later: usize,
        later_new: usize,
    },
    #[error("coverage violated: block {block_id} offset {offset} is neither mapped nor deleted")]
    Coverage { block_id: String, offset: usize },
    #[error("locality violated in block {block_id}: unedited offset {offset} moved to {mapped:?}")]
    Locality { block_id: String, offset: usize, mapped: Option<usize> },
    #[error("determinism violated at {block_id}:{offset}: {first:?} vs {second:?}")]
    Determinism {
        block_id: String,
        offset: usize,
        first: Option<(String, usize)>,
        second: Option<(String, usize)>,
    },
}

/// For every `a < b` in `0..=len` of one old block that both land in the
/// same new block, `map(a) <= map(b)`.
pub fn verify_monotonicity(
    mapping: &BlockMapping,
    block_id: &str,
    len: usize,
) -> Result<(), MappingViolation> {
    let mut last_by_block: HashMap<String, (usize, usize)> = HashMap::new();

    for offset in 0..=len {
        let Some(position) = mapping.map_old_to_new(block_id, offset) else { continue };
        if let Some(&(earlier, earlier_new)) = last_by_block.get(&position.new_block_id) {
            if position.new_abs_in_block < earlier_new {
                return Err(MappingViolation::Monotonicity {
                    block_id: block_id.to_string(),
                    new_block_id: position.new_block_id,
                    earlier,
                    earlier_new,
                    later: offset,
                    later_new: position.new_abs_in_block,
                });
            }
        }
        last_by_block.insert(position.new_block_id, (offset, position.new_abs_in_block));
    }

    Ok(())
}

/// Every offset of every listed old block either maps somewhere or is
/// explicitly deleted.
pub fn verify_coverage(
    mapping: &BlockMapping,
    blocks: &[(String, usize)],
) -> Result<(), MappingViolation> {
    for (block_id, len) in blocks {
        for offset in 0..=*len {
            if mapping.map_old_to_new(block_id, offset).is_none()
                && !mapping.is_deleted(block_id, offset)
            {
                return Err(MappingViolation::Coverage { block_id: block_id.clone(), offset });
            }
        }
    }
    Ok(())
}

/// Offsets before the first edit of a block keep their offset.
pub fn verify_locality(
    mapping: &BlockMapping,
    block_id: &str,
    len: usize,
) -> Result<(), MappingViolation> {
    if !mapping.contains(block_id) {
        return Ok(());
    }
    let untouched_end = mapping.first_affected_offset(block_id).unwrap_or(len + 1).min(len + 1);

    for offset in 0..untouched_end {
        let mapped = mapping.map_old_to_new(block_id, offset).map(|p| p.new_abs_in_block);
        if mapped != Some(offset) {
            return Err(MappingViolation::Locality {
                block_id: block_id.to_string(),
                offset,
                mapped,
            });
        }
    }
    Ok(())
}

/// Compiling the same batch twice answers every probe identically.
pub fn verify_determinism(
    transforms: &[BlockTransform],
    options: &MappingOptions<'_>,
    probes: &[(String, usize)],
) -> Result<(), MappingError> {
    let first = create_block_mapping(transforms, options)?;
    let second = create_block_mapping(transforms, options)?;

    for (block_id, offset) in probes {
        let left = first
            .map_old_to_new(block_id, *offset)
            .map(|p| (p.new_block_id, p.new_abs_in_block));
        let right = second
            .map_old_to_new(block_id, *offset)
            .map(|p| (p.new_block_id, p.new_abs_in_block));
        if left != right || first.derived_blocks_from(block_id) != second.derived_blocks_from(block_id)
        {
            return Err(MappingViolation::Determinism {
                block_id: block_id.clone(),
                offset: *offset,
                first: left,
                second: right,
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PositionDelta;

    fn modified(deltas: Vec<PositionDelta>) -> BlockMapping {
        create_block_mapping(
            &[BlockTransform::Modified { old_id: "b".into(), new_id: "b".into(), deltas }],
            &MappingOptions::default(),
        )
        .expect("mapping should build")
    }

    #[test]
    fn monotonicity_holds_for_mixed_edits() {
        let mapping = modified(vec![
            PositionDelta::insert("b", 2, 5),
            PositionDelta::delete("b", 4, 3),
            PositionDelta::delete("b", 5, 4),
            PositionDelta::insert("b", 12, 1),
        ]);
        assert_eq!(verify_monotonicity(&mapping, "b", 20), Ok(()));
    }

    #[test]
    fn coverage_accepts_deleted_ranges() {
        let mapping = modified(vec![PositionDelta::delete("b", 1, 3)]);
        assert_eq!(verify_coverage(&mapping, &[("b".into(), 8)]), Ok(()));
    }

    #[test]
    fn coverage_flags_blocks_without_transform() {
        let mapping = modified(vec![]);
        let violation = verify_coverage(&mapping, &[("missing".into(), 2)]).unwrap_err();
        assert_eq!(violation, MappingViolation::Coverage { block_id: "missing".into(), offset: 0 });
    }

    #[test]
    fn locality_holds_before_first_edit() {
        let mapping = modified(vec![PositionDelta::insert("b", 6, 2)]);
        assert_eq!(verify_locality(&mapping, "b", 10), Ok(()));
    }

    #[test]
    fn determinism_holds_for_split_batch() {
        let transforms = vec![BlockTransform::Split {
            old_id: "b".into(),
            new_ids: vec!["b".into(), "c".into()],
            split_at: 3,
        }];
        let probes: Vec<(String, usize)> = (0..6).map(|o| ("b".to_string(), o)).collect();
        assert!(verify_determinism(&transforms, &MappingOptions::default(), &probes).is_ok());
    }
}
