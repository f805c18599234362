// `tether check`: run a gateway request through the conflict gate.

use std::path::PathBuf;

use clap::Args;
use serde::Deserialize;
use tether_core::gateway::{admit_request, AiGatewayRequest, Admission};
use tether_core::DocumentSnapshot;

use super::{read_fixture, Context};
use crate::exit_code::ExitCode;
use crate::output;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// JSON fixture: `{document, request}`.
    fixture: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct CheckFixture {
    pub document: DocumentSnapshot,
    pub request: AiGatewayRequest,
}

pub fn run(args: CheckArgs, ctx: &Context) -> anyhow::Result<ExitCode> {
    let config = ctx.config()?;
    let fixture: CheckFixture = read_fixture(&args.fixture)?;

    let mut request = fixture.request;
    request.ensure_request_id();
    let admission = admit_request(&request, &fixture.document, &config.targeting);

    output::print_output(ctx.format, &admission, format_human)?;
    Ok(exit_code_for(&admission))
}

fn exit_code_for(admission: &Admission) -> ExitCode {
    if admission.is_accepted() {
        ExitCode::Success
    } else {
        ExitCode::Conflict
    }
}

fn format_human(admission: &Admission) -> String {
    match admission {
        Admission::Accepted { request, resolution } => {
            let mut lines = vec![format!("accepted at frontier {}", request.doc_frontier_tag)];
            for trim in &resolution.trimming {
                lines.push(format!(
                    "  trimmed {} -> {} ({:.0}% preserved)",
                    trim.span_id,
                    trim.trimmed_span_id,
                    trim.preserved_ratio * 100.0
                ));
            }
            for retarget in &resolution.retargeting {
                lines.push(format!(
                    "  retargeted {} -> {} in {}",
                    retarget.span_id, retarget.resolved_span_id, retarget.resolved_block_id
                ));
            }
            lines.join("\n")
        }
        Admission::Rejected { conflict } => {
            let mut lines = vec![format!("{} {}: {}", conflict.status, conflict.reason, conflict.message)];
            lines.push(format!("  server frontier: {}", conflict.server_frontier_tag));
            for failure in &conflict.failed_preconditions {
                lines.push(format!("  {} [{}] {}", failure.span_id, failure.reason, failure.detail));
            }
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::gateway::{ConflictReason, TargetingPolicy};

    const FIXTURE: &str = r#"{
        "document": {
            "doc_id": "doc",
            "frontier_tag": "v1",
            "spans": [{
                "span_id": "s1", "annotation_id": "a1", "block_id": "b1",
                "text": "hello", "context_hash": "h1", "is_verified": true
            }]
        },
        "request": {
            "doc_id": "doc",
            "doc_frontier_tag": "v1",
            "target_spans": [{"span_id": "s1", "annotation_id": "a1", "if_match_context_hash": "h1"}],
            "instructions": "tighten"
        }
    }"#;

    fn fixture() -> CheckFixture {
        serde_json::from_str(FIXTURE).unwrap()
    }

    #[test]
    fn matching_request_is_accepted() {
        let f = fixture();
        let admission = admit_request(&f.request, &f.document, &TargetingPolicy::default());
        assert_eq!(exit_code_for(&admission), ExitCode::Success);
        assert!(format_human(&admission).starts_with("accepted at frontier v1"));
    }

    #[test]
    fn client_ahead_is_a_conflict() {
        let mut f = fixture();
        f.request.doc_frontier_tag = "v2".into();
        let admission = admit_request(&f.request, &f.document, &TargetingPolicy::default());
        assert_eq!(exit_code_for(&admission), ExitCode::Conflict);
        let Admission::Rejected { conflict } = &admission else { panic!("expected rejection") };
        assert_eq!(conflict.reason, ConflictReason::FrontierMismatch);
        assert!(format_human(&admission).starts_with("409 frontier_mismatch"));
    }

    #[test]
    fn run_reads_fixture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.json");
        std::fs::write(&path, FIXTURE).unwrap();
        let config = dir.path().join("gateway.toml");
        std::fs::write(&config, "").unwrap();
        let ctx = Context { format: crate::output::OutputFormat::Json, config_path: Some(config) };
        assert_eq!(run(CheckArgs { fixture: path }, &ctx).unwrap(), ExitCode::Success);
    }
}
