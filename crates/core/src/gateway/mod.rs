// AI gateway: conflict safety for agent edits against a live document.
//
// Request flow: `check_conflicts` validates the frontier and strong
// preconditions, `resolve_weak_preconditions` recovers what it can, and
// on rejection the retry playbook computes backoff and relocations for
// the next attempt.

pub mod conflict;
pub mod provider;
pub mod retry;
pub mod targeting;
pub mod types;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use conflict::{check_conflicts, check_span_precondition, check_span_precondition_v1};
pub use provider::{DocumentContentAccessor, GatewayDocumentProvider, RelocationProvider};
pub use retry::{
    calculate_backoff, create_aggressive_retry_policy, create_lenient_retry_policy, create_strict_retry_policy,
    is_retryable, plan_next_attempt, relocate_all_spans, relocate_span, update_request_after_rebase,
    update_retry_state, RebaseResult, RetryPlan, RetryPolicy, RetryState, SpanRelocation, SpanRelocationMethod,
};
pub use targeting::{
    format_trimmed_span_id, parse_trimmed_span_id, resolve_weak_preconditions, TargetingPolicy, TargetingResolution,
};
pub use types::{
    AiGatewayRequest, ConflictReason, ConflictResponse, FailedPrecondition, SpanState, TargetPreconditionV1,
    TargetSpan,
};

/// Result of the full request-time gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Accepted { request: Box<AiGatewayRequest>, resolution: Box<TargetingResolution> },
    Rejected { conflict: Box<ConflictResponse> },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Run the strong checks, then weak recovery. Unrecoverable weak failures
/// reject the request like strong ones.
pub fn admit_request(
    request: &AiGatewayRequest,
    provider: &dyn GatewayDocumentProvider,
    policy: &TargetingPolicy,
) -> Admission {
    if let Err(conflict) = check_conflicts(request, provider) {
        return Admission::Rejected { conflict: Box::new(conflict) };
    }

    let resolution = resolve_weak_preconditions(request, provider, policy);
    if !resolution.ok {
        let server_frontier = provider.frontier_tag();
        if let Some(conflict) =
            ConflictResponse::from_failures(request, &server_frontier, resolution.failures.clone())
        {
            debug!(doc_id = %request.doc_id, reason = %conflict.reason, "weak preconditions rejected request");
            return Admission::Rejected { conflict: Box::new(conflict) };
        }
    }

    Admission::Accepted { request: Box::new(resolution.request.clone()), resolution: Box::new(resolution) }
}
