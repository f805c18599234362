// `tether relocate`: map an anchor through an edit batch, falling back to
// fuzzy search at the aggressive level.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Args;
use serde::Deserialize;
use tether_core::mapping::{create_block_mapping, BlockTransform, MappingOptions};
use tether_core::relocate::{relocate_with_fallback, FuzzyRelocationConfig};
use tether_core::{Anchor, DocumentSnapshot, RelocationLevel, RelocationOutcome};

use super::{read_fixture, Context};
use crate::exit_code::ExitCode;
use crate::output;

#[derive(Debug, Args)]
pub struct RelocateArgs {
    /// JSON fixture: `{transforms, document, anchor, original_text, level?}`.
    fixture: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RelocateFixture {
    pub transforms: Vec<BlockTransform>,
    /// Post-edit document the anchor must land in.
    pub document: DocumentSnapshot,
    pub anchor: Anchor,
    #[serde(default)]
    pub original_text: String,
    /// Overrides the configured retry level.
    #[serde(default)]
    pub level: Option<RelocationLevel>,
    /// Pre-edit block texts; when present the transforms are validated.
    #[serde(default)]
    pub old_blocks: Option<HashMap<String, String>>,
}

pub fn run(args: RelocateArgs, ctx: &Context) -> anyhow::Result<ExitCode> {
    let config = ctx.config()?;
    let fixture: RelocateFixture = read_fixture(&args.fixture)?;
    let level = fixture.level.unwrap_or(config.retry.relocation_level);

    let outcome = relocate(&fixture, level, &config.fuzzy)?;
    output::print_output(ctx.format, &outcome, format_human)?;
    Ok(ExitCode::Success)
}

fn relocate(
    fixture: &RelocateFixture,
    level: RelocationLevel,
    fuzzy: &FuzzyRelocationConfig,
) -> anyhow::Result<RelocationOutcome> {
    let options =
        MappingOptions { block_texts: fixture.old_blocks.as_ref(), verify_invariants: fixture.old_blocks.is_some() };
    let mapping = create_block_mapping(&fixture.transforms, &options).context("building block mapping")?;
    Ok(relocate_with_fallback(&fixture.anchor, &fixture.original_text, &mapping, &fixture.document, level, fuzzy))
}

fn format_human(outcome: &RelocationOutcome) -> String {
    let method = serde_json::to_value(outcome.method)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    match &outcome.anchor {
        Some(anchor) => format!("{anchor} via {method} (confidence {:.2})", outcome.confidence),
        None => format!(
            "not relocated: searched {} block(s), {} candidate(s), best score {:.2}",
            outcome.debug.blocks_searched, outcome.debug.candidates_considered, outcome.debug.best_score
        ),
    }
}
