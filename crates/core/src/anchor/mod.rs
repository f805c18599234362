// Anchors: stable positions inside a block's text.
//
// An anchor names a gap between characters (`offset` counts chars from the
// block start) and a bias that says which neighbor it sticks to when text is
// inserted exactly at that gap.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{decode_anchor, encode_anchor, AnchorCodec, AnchorCodecError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    Before,
    After,
}

impl Bias {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Before => 0,
            Self::After => 1,
        }
    }

    pub(crate) fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Before),
            1 => Some(Self::After),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before" => Some(Self::Before),
            "after" => Some(Self::After),
            _ => None,
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

/// A position inside a block. Immutable once captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Anchor {
    pub block_id: String,
    pub offset: usize,
    pub bias: Bias,
}

impl Anchor {
    pub fn new(block_id: impl Into<String>, offset: usize, bias: Bias) -> Self {
        Self { block_id: block_id.into(), offset, bias }
    }

    /// Same bias, new location.
    pub fn moved_to(&self, block_id: impl Into<String>, offset: usize) -> Self {
        Self { block_id: block_id.into(), offset, bias: self.bias }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_id, self.offset, self.bias)
    }
}

/// Order two anchors by block position in `block_order`, then offset, then
/// bias (`before` sorts left of `after`).
///
/// Blocks missing from `block_order` sort after every known block, and among
/// themselves by id so the ordering stays total.
pub fn compare_anchors(a: &Anchor, b: &Anchor, block_order: &[String]) -> Ordering {
    if a.block_id != b.block_id {
        let index_of = |id: &str| block_order.iter().position(|candidate| candidate == id);
        let by_block = match (index_of(&a.block_id), index_of(&b.block_id)) {
            (Some(left), Some(right)) => left.cmp(&right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.block_id.cmp(&b.block_id),
        };
        if by_block != Ordering::Equal {
            return by_block;
        }
    }

    a.offset.cmp(&b.offset).then(a.bias.cmp(&b.bias))
}

/// Sort anchors in document order. Builds the block index once instead of
/// scanning `block_order` per comparison.
pub fn sort_anchors(anchors: &mut [Anchor], block_order: &[String]) {
    let index: HashMap<&str, usize> =
        block_order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    anchors.sort_by(|a, b| {
        let left = index.get(a.block_id.as_str()).copied().unwrap_or(usize::MAX);
        let right = index.get(b.block_id.as_str()).copied().unwrap_or(usize::MAX);
        left.cmp(&right)
            .then_with(|| if left == usize::MAX { a.block_id.cmp(&b.block_id) } else { Ordering::Equal })
            .then(a.offset.cmp(&b.offset))
            .then(a.bias.cmp(&b.bias))
    });
}
