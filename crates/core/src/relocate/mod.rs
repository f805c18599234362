// Anchor relocation after document edits.
//
// Levels escalate: the exact mapping, the same mapping checked against the
// live block text, then a fuzzy search around the original block. A failed
// relocation is a normal outcome (`method = failed`), never an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::anchor::Anchor;
use crate::gateway::provider::DocumentContentAccessor;
use crate::mapping::BlockMapping;

pub mod context;
pub mod fuzzy;

pub use context::{get_search_order, relocate_anchor_fuzzy, ContextRelocationConfig};
pub use fuzzy::{fuzzy_relocate_anchor, FuzzyRelocationConfig};

/// How much document drift a caller will tolerate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RelocationLevel {
    /// Exact mapping / exact hash only.
    #[default]
    Strict = 1,
    /// Adds fuzzy text matching.
    Lenient = 2,
    /// Adds semantic matching and the fuzzy anchor search.
    Aggressive = 3,
}

impl RelocationLevel {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn allows_fuzzy_text(self) -> bool {
        matches!(self, Self::Lenient | Self::Aggressive)
    }

    pub const fn allows_semantic(self) -> bool {
        matches!(self, Self::Aggressive)
    }
}

impl From<RelocationLevel> for u8 {
    fn from(level: RelocationLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for RelocationLevel {
    type Error = InvalidRelocationLevel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Strict),
            2 => Ok(Self::Lenient),
            3 => Ok(Self::Aggressive),
            other => Err(InvalidRelocationLevel(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("relocation level must be 1, 2 or 3, got {0}")]
pub struct InvalidRelocationLevel(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationMethod {
    Exact,
    IntegrityCheck,
    FuzzyText,
    ContextHash,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelocationDebug {
    pub blocks_searched: usize,
    pub candidates_considered: usize,
    /// Best score seen, including candidates under the threshold.
    pub best_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocationOutcome {
    pub anchor: Option<Anchor>,
    pub confidence: f64,
    pub method: RelocationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_len: Option<usize>,
    #[serde(default)]
    pub debug: RelocationDebug,
}

impl RelocationOutcome {
    pub fn failed(debug: RelocationDebug) -> Self {
        Self { anchor: None, confidence: 0.0, method: RelocationMethod::Failed, matched_len: None, debug }
    }

    fn mapped(anchor: Anchor, method: RelocationMethod) -> Self {
        Self { anchor: Some(anchor), confidence: 1.0, method, matched_len: None, debug: RelocationDebug::default() }
    }

    pub fn is_relocated(&self) -> bool {
        self.anchor.is_some()
    }
}

/// Levels 1-2: trust the compiled mapping.
pub fn relocate_anchor(anchor: &Anchor, mapping: &BlockMapping) -> Option<Anchor> {
    mapping
        .map_old_to_new(&anchor.block_id, anchor.offset)
        .map(|position| anchor.moved_to(position.new_block_id, position.new_abs_in_block))
}

/// Run the levels in order up to `level`.
///
/// The integrity check rejects a mapped position that falls outside the
/// live block text. Fuzzy search only runs at `Aggressive`.
pub fn relocate_with_fallback(
    anchor: &Anchor,
    original_text: &str,
    mapping: &BlockMapping,
    accessor: &dyn DocumentContentAccessor,
    level: RelocationLevel,
    config: &FuzzyRelocationConfig,
) -> RelocationOutcome {
    if let Some(mapped) = relocate_anchor(anchor, mapping) {
        if level == RelocationLevel::Strict {
            return RelocationOutcome::mapped(mapped, RelocationMethod::Exact);
        }
        if position_is_live(&mapped, accessor) {
            return RelocationOutcome::mapped(mapped, RelocationMethod::IntegrityCheck);
        }
        debug!(anchor = %anchor, mapped = %mapped, "mapped position failed integrity check");
    }

    if level != RelocationLevel::Aggressive {
        debug!(anchor = %anchor, level = level.as_u8(), "relocation failed without fuzzy search");
        return RelocationOutcome::failed(RelocationDebug::default());
    }

    debug!(anchor = %anchor, "falling back to fuzzy relocation");
    fuzzy_relocate_anchor(anchor, original_text, Some(mapping), accessor, config)
}

fn position_is_live(anchor: &Anchor, accessor: &dyn DocumentContentAccessor) -> bool {
    accessor
        .block_content(&anchor.block_id)
        .is_some_and(|text| anchor.offset <= text.chars().count())
}

/// An annotation's anchor plus what it pointed at when captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationAnchor {
    pub annotation_id: String,
    pub anchor: Anchor,
    pub original_text: String,
    /// `prefix|suffix` signature captured with the anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocatedAnnotation {
    pub annotation_id: String,
    pub outcome: RelocationOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRelocation {
    pub relocated: Vec<RelocatedAnnotation>,
    pub orphaned: Vec<RelocatedAnnotation>,
}

impl BatchRelocation {
    fn push(&mut self, annotation_id: &str, outcome: RelocationOutcome) {
        let entry = RelocatedAnnotation { annotation_id: annotation_id.to_string(), outcome };
        if entry.outcome.is_relocated() {
            self.relocated.push(entry);
        } else {
            self.orphaned.push(entry);
        }
    }
}

pub fn relocate_annotations(
    annotations: &[AnnotationAnchor],
    mapping: &BlockMapping,
    accessor: &dyn DocumentContentAccessor,
    level: RelocationLevel,
    config: &FuzzyRelocationConfig,
) -> BatchRelocation {
    let mut batch = BatchRelocation::default();
    for annotation in annotations {
        let outcome = relocate_with_fallback(
            &annotation.anchor,
            &annotation.original_text,
            mapping,
            accessor,
            level,
            config,
        );
        batch.push(&annotation.annotation_id, outcome);
    }
    debug!(relocated = batch.relocated.len(), orphaned = batch.orphaned.len(), "relocated annotations");
    batch
}

/// Context-signature relocation for every annotation. Annotations captured
/// without a signature are orphaned.
pub fn batch_fuzzy_relocate(
    annotations: &[AnnotationAnchor],
    accessor: &dyn DocumentContentAccessor,
    config: &ContextRelocationConfig,
) -> BatchRelocation {
    let mut batch = BatchRelocation::default();
    for annotation in annotations {
        let outcome = match &annotation.original_context {
            Some(context) => relocate_anchor_fuzzy(&annotation.anchor, context, None, accessor, config),
            None => RelocationOutcome::failed(RelocationDebug::default()),
        };
        batch.push(&annotation.annotation_id, outcome);
    }
    batch
}
