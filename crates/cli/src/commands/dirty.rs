// `tether dirty`: blocks an edit forces consumers to re-verify.

use std::path::PathBuf;

use clap::Args;
use serde::Deserialize;
use tether_core::dirty::{compute_dirty_info, DirtyInfo, DirtyOptions, EditSummary, NeighborExpansionPolicy};

use super::{read_fixture, Context};
use crate::exit_code::ExitCode;
use crate::output;

#[derive(Debug, Args)]
pub struct DirtyArgs {
    /// JSON fixture: `{touched_blocks, op_codes, order?}`.
    fixture: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct DirtyFixture {
    #[serde(flatten)]
    pub summary: EditSummary,
    #[serde(default)]
    pub order: Option<Vec<String>>,
}

pub fn run(args: DirtyArgs, ctx: &Context) -> anyhow::Result<ExitCode> {
    let config = ctx.config()?;
    let fixture: DirtyFixture = read_fixture(&args.fixture)?;

    let info = dirty_region(&fixture, &config.neighbors);
    output::print_output(ctx.format, &info, format_human)?;
    Ok(ExitCode::Success)
}

fn dirty_region(fixture: &DirtyFixture, policy: &NeighborExpansionPolicy) -> DirtyInfo {
    let options = DirtyOptions { order: fixture.order.as_deref(), neighbor_policy: Some(policy) };
    compute_dirty_info(&fixture.summary, options)
}

fn format_human(info: &DirtyInfo) -> String {
    let mut lines = vec![format!("touched: {}", info.touched_block_ids.join(", "))];
    lines.push(format!("re-verify: {}", info.expanded_block_ids.join(", ")));
    for (block_id, range) in &info.blocks {
        match range {
            Some(range) => lines.push(format!("  {block_id} [{}, {})", range.start, range.end)),
            None => lines.push(format!("  {block_id} (whole block)")),
        }
    }
    if info.neighbors_pending {
        lines.push("structural edit without block order: neighbors pending".into());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(json: &str) -> DirtyFixture {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn structural_edit_expands_neighbors() {
        let f = fixture(
            r#"{
                "touched_blocks": [{"block_id": "b3", "range": {"start": 2, "end": 5}}],
                "op_codes": ["split_block"],
                "order": ["b1", "b2", "b3", "b4", "b5"]
            }"#,
        );
        let info = dirty_region(&f, &NeighborExpansionPolicy::default());
        assert_eq!(info.touched_block_ids, vec!["b3"]);
        assert_eq!(info.expanded_block_ids, vec!["b2", "b3", "b4"]);
        let text = format_human(&info);
        assert!(text.contains("b3 [2, 5)"));
    }

    #[test]
    fn whole_block_edit_with_order() {
        let f = fixture(
            r#"{
                "touched_blocks": [{"block_id": "b2"}],
                "op_codes": ["insert_text"],
                "order": ["b1", "b2", "b3"]
            }"#,
        );
        let info = dirty_region(&f, &NeighborExpansionPolicy::default());
        assert_eq!(info.expanded_block_ids, vec!["b1", "b2", "b3"]);
        assert!(!info.neighbors_pending);
        assert!(format_human(&info).contains("b2 (whole block)"));
    }
}
