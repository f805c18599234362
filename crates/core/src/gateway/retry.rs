// Retry playbook: 409 -> backoff -> relocate -> resubmit.
//
// The core never sleeps. Each step returns the next state and the backoff
// the caller should wait before resubmitting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::relocate::RelocationLevel;

use super::provider::RelocationProvider;
use super::targeting::parse_trimmed_span_id;
use super::types::{AiGatewayRequest, ConflictReason, ConflictResponse, FailedPrecondition, SpanState};

/// Similarity a fuzzy text match must reach to count as a relocation.
pub const FUZZY_TEXT_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub relocation_level: RelocationLevel,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        create_strict_retry_policy()
    }
}

/// Exact matches only, 3 retries.
pub fn create_strict_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        relocation_level: RelocationLevel::Strict,
        backoff_base_ms: 100,
        backoff_multiplier: 2.0,
        max_backoff_ms: 5_000,
    }
}

/// Adds fuzzy text relocation, 5 retries.
pub fn create_lenient_retry_policy() -> RetryPolicy {
    RetryPolicy { max_retries: 5, relocation_level: RelocationLevel::Lenient, ..create_strict_retry_policy() }
}

/// Adds semantic relocation, 7 retries.
pub fn create_aggressive_retry_policy() -> RetryPolicy {
    RetryPolicy { max_retries: 7, relocation_level: RelocationLevel::Aggressive, ..create_strict_retry_policy() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanRelocationMethod {
    ExactHash,
    FuzzyText,
    Semantic,
}

/// Outcome of relocating one failed span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRelocation {
    pub success: bool,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_annotation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_context_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<SpanRelocationMethod>,
    pub confidence: f64,
}

impl SpanRelocation {
    fn failed(span_id: &str) -> Self {
        Self {
            success: false,
            span_id: span_id.to_string(),
            new_span_id: None,
            new_annotation_id: None,
            new_block_id: None,
            new_context_hash: None,
            method: None,
            confidence: 0.0,
        }
    }

    fn found(span_id: &str, state: SpanState, method: SpanRelocationMethod, confidence: f64) -> Self {
        Self {
            success: true,
            span_id: span_id.to_string(),
            new_span_id: Some(state.span_id),
            new_annotation_id: Some(state.annotation_id),
            new_block_id: Some(state.block_id),
            new_context_hash: Some(state.context_hash),
            method: Some(method),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt: u32,
    pub relocated_spans: HashMap<String, SpanRelocation>,
    pub should_continue: bool,
    pub next_backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_conflict: Option<ConflictResponse>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            relocated_spans: HashMap::new(),
            should_continue: true,
            next_backoff_ms: 0,
            last_conflict: None,
        }
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn is_retryable(reason: ConflictReason) -> bool {
    reason.is_retryable()
}

/// `min(max_backoff_ms, backoff_base_ms * backoff_multiplier^attempt)`
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> u64 {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = policy.backoff_base_ms as f64 * policy.backoff_multiplier.powi(exponent);
    if !raw.is_finite() || raw >= policy.max_backoff_ms as f64 {
        policy.max_backoff_ms
    } else {
        raw.max(0.0) as u64
    }
}

/// Record one conflict and decide whether to keep going.
pub fn update_retry_state(state: &RetryState, conflict: &ConflictResponse, policy: &RetryPolicy) -> RetryState {
    let attempt = state.attempt + 1;
    let should_continue = attempt < policy.max_retries && is_retryable(conflict.reason);

    if !should_continue {
        warn!(
            attempt,
            max_retries = policy.max_retries,
            reason = %conflict.reason,
            "retry loop stopped"
        );
    }

    RetryState {
        attempt,
        relocated_spans: state.relocated_spans.clone(),
        should_continue,
        next_backoff_ms: calculate_backoff(attempt, policy),
        last_conflict: Some(conflict.clone()),
    }
}

/// Relocate one failed span with the backends `level` allows:
/// exact context hash, then fuzzy text (level 2+), then semantic (level 3).
pub fn relocate_span(
    failure: &FailedPrecondition,
    original_text: Option<&str>,
    level: RelocationLevel,
    provider: &dyn RelocationProvider,
    doc_id: &str,
) -> SpanRelocation {
    if let Some(expected) = failure.expected_hash.as_deref() {
        if let Some(state) = provider.find_by_context_hash(doc_id, expected) {
            return SpanRelocation::found(&failure.span_id, state, SpanRelocationMethod::ExactHash, 1.0);
        }
    }

    if let Some(text) = original_text {
        if level.allows_fuzzy_text() {
            if let Some((state, score)) = provider.find_by_fuzzy_text(doc_id, text, FUZZY_TEXT_THRESHOLD) {
                return SpanRelocation::found(&failure.span_id, state, SpanRelocationMethod::FuzzyText, score);
            }
        }
        if level.allows_semantic() {
            if let Some((state, score)) = provider.find_by_semantic(doc_id, text) {
                return SpanRelocation::found(&failure.span_id, state, SpanRelocationMethod::Semantic, score);
            }
        }
    }

    debug!(span_id = %failure.span_id, level = level.as_u8(), "span relocation failed");
    SpanRelocation::failed(&failure.span_id)
}

/// Relocate every relocatable failure. `original_texts` is keyed by span id.
pub fn relocate_all_spans(
    failures: &[FailedPrecondition],
    original_texts: &HashMap<String, String>,
    level: RelocationLevel,
    provider: &dyn RelocationProvider,
    doc_id: &str,
) -> HashMap<String, SpanRelocation> {
    failures
        .iter()
        .filter(|failure| failure.reason.is_relocatable())
        .map(|failure| {
            let text = original_texts
                .get(&failure.span_id)
                .or_else(|| original_texts.get(parse_trimmed_span_id(&failure.span_id).0))
                .map(String::as_str);
            (failure.span_id.clone(), relocate_span(failure, text, level, provider, doc_id))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedSpan {
    pub span_id: String,
    pub context_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseResult {
    pub new_frontier_tag: String,
    /// Keyed by the span id the request used.
    #[serde(default)]
    pub updated_spans: HashMap<String, UpdatedSpan>,
}

struct SpanRewrite<'a> {
    span_id: &'a str,
    annotation_id: Option<&'a str>,
    block_id: Option<&'a str>,
    context_hash: &'a str,
}

/// Rewrite the request onto the rebased frontier. A successful relocation
/// wins over the rebase's updated span.
pub fn update_request_after_rebase(
    request: &AiGatewayRequest,
    rebase: &RebaseResult,
    relocations: &HashMap<String, SpanRelocation>,
) -> AiGatewayRequest {
    let mut updated = request.clone();
    updated.doc_frontier_tag = rebase.new_frontier_tag.clone();

    for target in &mut updated.target_spans {
        if let Some(rewrite) = span_rewrite(&target.span_id, rebase, relocations) {
            target.span_id = rewrite.span_id.to_string();
            target.if_match_context_hash = rewrite.context_hash.to_string();
            if let Some(annotation_id) = rewrite.annotation_id {
                target.annotation_id = annotation_id.to_string();
            }
        }
    }

    let flat = updated.preconditions.iter_mut().flatten();
    let layered = updated
        .layered_preconditions
        .iter_mut()
        .flat_map(|layered| layered.strong.iter_mut().chain(layered.weak.iter_mut()));
    for precondition in flat.chain(layered) {
        if let Some(rewrite) = span_rewrite(&precondition.span_id, rebase, relocations) {
            precondition.span_id = rewrite.span_id.to_string();
            precondition.hard.context_hash = rewrite.context_hash.to_string();
            if let Some(annotation_id) = rewrite.annotation_id {
                precondition.annotation_id = annotation_id.to_string();
            }
            if let Some(block_id) = rewrite.block_id {
                precondition.block_id = block_id.to_string();
            }
        }
    }

    updated
}

fn span_rewrite<'a>(
    span_id: &str,
    rebase: &'a RebaseResult,
    relocations: &'a HashMap<String, SpanRelocation>,
) -> Option<SpanRewrite<'a>> {
    if let Some(relocation) = relocations.get(span_id).filter(|r| r.success) {
        if let (Some(new_span_id), Some(hash)) = (&relocation.new_span_id, &relocation.new_context_hash) {
            return Some(SpanRewrite {
                span_id: new_span_id,
                annotation_id: relocation.new_annotation_id.as_deref(),
                block_id: relocation.new_block_id.as_deref(),
                context_hash: hash,
            });
        }
    }
    rebase.updated_spans.get(span_id).map(|span| SpanRewrite {
        span_id: &span.span_id,
        annotation_id: None,
        block_id: None,
        context_hash: &span.context_hash,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAttempt {
    pub request: AiGatewayRequest,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPlan {
    pub state: RetryState,
    /// `None` once the loop must stop; present `last_conflict` to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextAttempt>,
}

/// One iteration of the playbook: record the conflict, relocate the failed
/// spans at the policy's level and rebase the request onto the server
/// frontier the conflict reported.
pub fn plan_next_attempt(
    request: &AiGatewayRequest,
    conflict: &ConflictResponse,
    state: &RetryState,
    policy: &RetryPolicy,
    relocation_provider: &dyn RelocationProvider,
    original_texts: &HashMap<String, String>,
) -> RetryPlan {
    let mut next_state = update_retry_state(state, conflict, policy);
    if !next_state.should_continue {
        return RetryPlan { state: next_state, next: None };
    }

    let relocations = relocate_all_spans(
        &conflict.failed_preconditions,
        original_texts,
        policy.relocation_level,
        relocation_provider,
        &request.doc_id,
    );
    let rebase = RebaseResult { new_frontier_tag: conflict.server_frontier_tag.clone(), updated_spans: HashMap::new() };
    let next_request = update_request_after_rebase(request, &rebase, &relocations);
    next_state.relocated_spans.extend(relocations);

    debug!(
        doc_id = %request.doc_id,
        attempt = next_state.attempt,
        backoff_ms = next_state.next_backoff_ms,
        "planned retry"
    );

    let backoff_ms = next_state.next_backoff_ms;
    RetryPlan { state: next_state, next: Some(NextAttempt { request: next_request, backoff_ms }) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{RequestFormat, TargetSpan};

    fn conflict(reason: ConflictReason) -> ConflictResponse {
        ConflictResponse {
            status: 409,
            reason,
            server_frontier_tag: "v5".into(),
            failed_preconditions: Vec::new(),
            message: String::new(),
            request_id: None,
            client_request_id: None,
        }
    }

    fn span(span_id: &str, hash: &str, text: &str) -> SpanState {
        SpanState {
            span_id: span_id.into(),
            annotation_id: format!("ann-{span_id}"),
            block_id: "b1".into(),
            text: text.into(),
            context_hash: hash.into(),
            window_hash: None,
            structure_hash: None,
            is_verified: true,
            span_start: None,
            span_end: None,
            block_index: None,
        }
    }

    struct Backends {
        by_hash: Vec<SpanState>,
        fuzzy: Option<(SpanState, f64)>,
        semantic: Option<(SpanState, f64)>,
    }

    impl RelocationProvider for Backends {
        fn find_by_context_hash(&self, _doc_id: &str, context_hash: &str) -> Option<SpanState> {
            self.by_hash.iter().find(|s| s.context_hash == context_hash).cloned()
        }

        fn find_by_fuzzy_text(&self, _doc_id: &str, _text: &str, _threshold: f64) -> Option<(SpanState, f64)> {
            self.fuzzy.clone()
        }

        fn find_by_semantic(&self, _doc_id: &str, _text: &str) -> Option<(SpanState, f64)> {
            self.semantic.clone()
        }
    }

    fn mismatch(span_id: &str, expected: &str) -> FailedPrecondition {
        FailedPrecondition::hash_mismatch(span_id, "ann", Some(expected), Some("other"), "context_hash mismatch")
    }

    // ── backoff ──

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = create_strict_retry_policy();
        let policy = RetryPolicy { max_retries: 10, ..policy };
        let mut state = RetryState::new();
        let mut backoffs = Vec::new();
        for _ in 0..7 {
            state = update_retry_state(&state, &conflict(ConflictReason::HashMismatch), &policy);
            backoffs.push(state.next_backoff_ms);
        }
        assert_eq!(backoffs, vec![200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn stops_exactly_at_max_retries() {
        let policy = create_strict_retry_policy();
        let mut state = RetryState::new();
        for expected_continue in [true, true, false] {
            state = update_retry_state(&state, &conflict(ConflictReason::FrontierMismatch), &policy);
            assert_eq!(state.should_continue, expected_continue, "attempt {}", state.attempt);
        }
        assert_eq!(state.attempt, 3);
        assert_eq!(state.last_conflict.as_ref().map(|c| c.reason), Some(ConflictReason::FrontierMismatch));
    }

    #[test]
    fn content_rejections_stop_immediately() {
        for reason in [ConflictReason::SchemaReject, ConflictReason::SanitizationReject] {
            let state = update_retry_state(&RetryState::new(), &conflict(reason), &create_aggressive_retry_policy());
            assert!(!state.should_continue);
            assert_eq!(state.attempt, 1);
        }
    }

    #[test]
    fn factory_policies_escalate() {
        let strict = create_strict_retry_policy();
        let lenient = create_lenient_retry_policy();
        let aggressive = create_aggressive_retry_policy();
        assert_eq!((strict.max_retries, strict.relocation_level), (3, RelocationLevel::Strict));
        assert_eq!((lenient.max_retries, lenient.relocation_level), (5, RelocationLevel::Lenient));
        assert_eq!((aggressive.max_retries, aggressive.relocation_level), (7, RelocationLevel::Aggressive));
    }

    #[test]
    fn huge_attempts_saturate() {
        assert_eq!(calculate_backoff(u32::MAX, &create_strict_retry_policy()), 5_000);
    }

    // ── relocation ──

    #[test]
    fn exact_hash_relocation() {
        let backends = Backends { by_hash: vec![span("s1", "h1", "text")], fuzzy: None, semantic: None };
        let result = relocate_span(&mismatch("s1", "h1"), None, RelocationLevel::Strict, &backends, "doc");
        assert!(result.success);
        assert_eq!(result.method, Some(SpanRelocationMethod::ExactHash));
        assert_eq!(result.new_block_id.as_deref(), Some("b1"));
    }

    #[test]
    fn fuzzy_text_needs_level_two() {
        let backends =
            Backends { by_hash: Vec::new(), fuzzy: Some((span("s9", "h9", "text"), 0.82)), semantic: None };
        let failure = mismatch("s1", "h1");

        let strict = relocate_span(&failure, Some("text"), RelocationLevel::Strict, &backends, "doc");
        assert!(!strict.success);

        let lenient = relocate_span(&failure, Some("text"), RelocationLevel::Lenient, &backends, "doc");
        assert!(lenient.success);
        assert_eq!(lenient.method, Some(SpanRelocationMethod::FuzzyText));
        assert_eq!(lenient.new_span_id.as_deref(), Some("s9"));
    }

    #[test]
    fn semantic_needs_level_three() {
        let backends = Backends { by_hash: Vec::new(), fuzzy: None, semantic: Some((span("s4", "h4", "t"), 0.9)) };
        let failure = mismatch("s1", "h1");
        assert!(!relocate_span(&failure, Some("t"), RelocationLevel::Lenient, &backends, "doc").success);
        let result = relocate_span(&failure, Some("t"), RelocationLevel::Aggressive, &backends, "doc");
        assert_eq!(result.method, Some(SpanRelocationMethod::Semantic));
    }

    #[test]
    fn relocate_all_skips_unrelocatable_failures() {
        let backends = Backends { by_hash: vec![span("s1", "h1", "x")], fuzzy: None, semantic: None };
        let failures = vec![mismatch("s1", "h1"), FailedPrecondition::unverified("s2", "ann")];
        let results = relocate_all_spans(&failures, &HashMap::new(), RelocationLevel::Strict, &backends, "doc");
        assert_eq!(results.len(), 1);
        assert!(results["s1"].success);
    }

    // ── rebase ──

    fn request() -> AiGatewayRequest {
        AiGatewayRequest {
            doc_id: "doc".into(),
            doc_frontier_tag: "v1".into(),
            target_spans: vec![
                TargetSpan { span_id: "s1".into(), annotation_id: "a1".into(), if_match_context_hash: "old1".into() },
                TargetSpan { span_id: "s2".into(), annotation_id: "a2".into(), if_match_context_hash: "old2".into() },
            ],
            preconditions: None,
            layered_preconditions: None,
            targeting: None,
            instructions: String::new(),
            format: RequestFormat::Html,
            request_id: None,
            client_request_id: None,
        }
    }

    #[test]
    fn relocation_wins_over_rebase() {
        let rebase = RebaseResult {
            new_frontier_tag: "v2".into(),
            updated_spans: HashMap::from([
                ("s1".to_string(), UpdatedSpan { span_id: "s1-rebased".into(), context_hash: "r1".into() }),
                ("s2".to_string(), UpdatedSpan { span_id: "s2-rebased".into(), context_hash: "r2".into() }),
            ]),
        };
        let relocations = HashMap::from([(
            "s1".to_string(),
            SpanRelocation::found("s1", span("s1-moved", "m1", "x"), SpanRelocationMethod::ExactHash, 1.0),
        )]);

        let updated = update_request_after_rebase(&request(), &rebase, &relocations);
        assert_eq!(updated.doc_frontier_tag, "v2");
        assert_eq!(updated.target_spans[0].span_id, "s1-moved");
        assert_eq!(updated.target_spans[0].if_match_context_hash, "m1");
        assert_eq!(updated.target_spans[1].span_id, "s2-rebased");
        assert_eq!(updated.target_spans[1].if_match_context_hash, "r2");
    }

    #[test]
    fn failed_relocations_fall_back_to_rebase() {
        let rebase = RebaseResult {
            new_frontier_tag: "v2".into(),
            updated_spans: HashMap::from([(
                "s1".to_string(),
                UpdatedSpan { span_id: "s1".into(), context_hash: "r1".into() },
            )]),
        };
        let relocations = HashMap::from([("s1".to_string(), SpanRelocation::failed("s1"))]);
        let updated = update_request_after_rebase(&request(), &rebase, &relocations);
        assert_eq!(updated.target_spans[0].if_match_context_hash, "r1");
        assert_eq!(updated.target_spans[1].if_match_context_hash, "old2");
    }

    // ── playbook ──

    #[test]
    fn plan_rebases_onto_server_frontier() {
        let backends = Backends { by_hash: vec![span("s1", "old1", "x")], fuzzy: None, semantic: None };
        let mut response = conflict(ConflictReason::HashMismatch);
        response.failed_preconditions = vec![mismatch("s1", "old1")];

        let plan = plan_next_attempt(
            &request(),
            &response,
            &RetryState::new(),
            &create_strict_retry_policy(),
            &backends,
            &HashMap::new(),
        );
        let next = plan.next.expect("should retry");
        assert_eq!(next.backoff_ms, 200);
        assert_eq!(next.request.doc_frontier_tag, "v5");
        assert!(plan.state.relocated_spans["s1"].success);
    }

    #[test]
    fn plan_stops_on_non_retryable() {
        let backends = Backends { by_hash: Vec::new(), fuzzy: None, semantic: None };
        let plan = plan_next_attempt(
            &request(),
            &conflict(ConflictReason::SanitizationReject),
            &RetryState::new(),
            &create_lenient_retry_policy(),
            &backends,
            &HashMap::new(),
        );
        assert!(plan.next.is_none());
        assert!(!plan.state.should_continue);
    }
}
