// Request-time conflict checks.
//
// Order: document existence, frontier comparison, then every span
// precondition. Span failures are all collected before the primary 409
// reason is chosen, so an unverified target is never hidden behind an
// unrelated hash mismatch.

use tracing::debug;

use super::provider::GatewayDocumentProvider;
use super::targeting::parse_trimmed_span_id;
use super::types::{AiGatewayRequest, ConflictResponse, FailedPrecondition, SpanState, TargetPreconditionV1, TargetSpan};

/// Validate `request` against live document state.
pub fn check_conflicts(
    request: &AiGatewayRequest,
    provider: &dyn GatewayDocumentProvider,
) -> Result<(), ConflictResponse> {
    if !provider.document_exists(&request.doc_id) {
        debug!(doc_id = %request.doc_id, "rejecting request for missing document");
        return Err(ConflictResponse::document_missing(request));
    }

    let server_frontier = provider.frontier_tag();
    let ordering = provider.compare_frontiers(&request.doc_frontier_tag, &server_frontier);
    if !ordering.is_acceptable() {
        debug!(
            doc_id = %request.doc_id,
            client = %request.doc_frontier_tag,
            server = %server_frontier,
            %ordering,
            "frontier mismatch"
        );
        return Err(ConflictResponse::frontier_mismatch(request, &server_frontier, ordering));
    }

    let failures: Vec<FailedPrecondition> = if request.uses_v1_preconditions() {
        request
            .strong_preconditions()
            .filter_map(|precondition| check_span_precondition_v1(precondition, provider))
            .collect()
    } else {
        request
            .target_spans
            .iter()
            .filter_map(|target| check_span_precondition(target, provider))
            .collect()
    };

    match ConflictResponse::from_failures(request, &server_frontier, failures) {
        Some(response) => {
            debug!(
                doc_id = %request.doc_id,
                reason = %response.reason,
                failures = response.failed_preconditions.len(),
                "span preconditions failed"
            );
            Err(response)
        }
        None => Ok(()),
    }
}

/// Legacy check: the span exists, is verified and has the expected context hash.
pub fn check_span_precondition(
    target: &TargetSpan,
    provider: &dyn GatewayDocumentProvider,
) -> Option<FailedPrecondition> {
    let (base_id, _) = parse_trimmed_span_id(&target.span_id);
    let Some(state) = provider.span_state(base_id) else {
        return Some(FailedPrecondition::missing(&target.span_id, &target.annotation_id));
    };
    if !state.is_verified {
        return Some(FailedPrecondition::unverified(&target.span_id, &target.annotation_id));
    }
    if state.context_hash != target.if_match_context_hash {
        return Some(FailedPrecondition::hash_mismatch(
            &target.span_id,
            &target.annotation_id,
            Some(&target.if_match_context_hash),
            Some(&state.context_hash),
            "context_hash mismatch",
        ));
    }
    None
}

pub fn check_span_precondition_v1(
    precondition: &TargetPreconditionV1,
    provider: &dyn GatewayDocumentProvider,
) -> Option<FailedPrecondition> {
    let (base_id, _) = parse_trimmed_span_id(&precondition.span_id);
    check_precondition_against(precondition, provider.span_state(base_id).as_ref())
}

/// V1 checks against an already fetched state: existence, block affinity,
/// verification, then each hard signal.
///
/// An expected window or structure hash that is absent is not checked. One
/// that is present but unavailable on the server fails closed.
pub(crate) fn check_precondition_against(
    precondition: &TargetPreconditionV1,
    state: Option<&SpanState>,
) -> Option<FailedPrecondition> {
    let span_id = precondition.span_id.as_str();
    let annotation_id = precondition.annotation_id.as_str();

    let Some(state) = state else {
        return Some(FailedPrecondition::missing(span_id, annotation_id));
    };
    if state.block_id != precondition.block_id {
        return Some(FailedPrecondition::hash_mismatch(
            span_id,
            annotation_id,
            None,
            None,
            format!("block_id mismatch: expected {}, found {}", precondition.block_id, state.block_id),
        ));
    }
    if !state.is_verified {
        return Some(FailedPrecondition::unverified(span_id, annotation_id));
    }

    let hard = &precondition.hard;
    if state.context_hash != hard.context_hash {
        return Some(FailedPrecondition::hash_mismatch(
            span_id,
            annotation_id,
            Some(&hard.context_hash),
            Some(&state.context_hash),
            "context_hash mismatch",
        ));
    }

    let optional_signals = [
        ("window_hash", hard.window_hash.as_deref(), state.window_hash.as_deref()),
        ("structure_hash", hard.structure_hash.as_deref(), state.structure_hash.as_deref()),
    ];
    for (signal, expected, actual) in optional_signals {
        let Some(expected) = expected else { continue };
        match actual {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Some(FailedPrecondition::hash_mismatch(
                    span_id,
                    annotation_id,
                    Some(expected),
                    Some(actual),
                    format!("{signal} mismatch"),
                ));
            }
            None => {
                return Some(FailedPrecondition::hash_mismatch(
                    span_id,
                    annotation_id,
                    Some(expected),
                    None,
                    format!("{signal} unavailable"),
                ));
            }
        }
    }

    None
}
