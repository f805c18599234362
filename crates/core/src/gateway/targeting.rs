// Weak precondition recovery.
//
// A weak precondition whose hard signals fail may be recovered instead of
// rejected: `trim_range` shrinks the requested range to its intersection
// with the live verified span, `relocate` retargets to another verified span
// that agrees on at least one hard signal. Neither ever widens the target.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::conflict::check_precondition_against;
use super::provider::GatewayDocumentProvider;
use super::types::{
    AiGatewayRequest, FailedPrecondition, HardSignals, MismatchAction, RelocatePolicy, SpanRange,
    SpanState, TargetPreconditionV1,
};

/// Server-side limits on weak recovery. Intersected with the request's own
/// `targeting` flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetingPolicy {
    pub allow_trim: bool,
    pub allow_auto_retarget: bool,
    pub relocate_policy: RelocatePolicy,
    /// Trims that keep less than this share of the declared range fail.
    pub min_preserved_ratio: f64,
}

impl Default for TargetingPolicy {
    fn default() -> Self {
        Self {
            allow_trim: true,
            allow_auto_retarget: true,
            relocate_policy: RelocatePolicy::SameBlock,
            min_preserved_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimRecord {
    pub span_id: String,
    pub trimmed_span_id: String,
    pub original_range: SpanRange,
    pub trimmed_range: SpanRange,
    pub original_length: usize,
    pub trimmed_length: usize,
    pub preserved_ratio: f64,
}

/// Which hard signals and position facts a retarget candidate agrees on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchVector {
    pub context_hash: bool,
    pub window_hash: bool,
    pub structure_hash: bool,
    pub same_block: bool,
    pub range_overlap: bool,
}

impl MatchVector {
    pub fn hard_agreements(&self) -> usize {
        [self.context_hash, self.window_hash, self.structure_hash].iter().filter(|&&m| m).count()
    }

    pub fn len(&self) -> usize {
        self.hard_agreements() + usize::from(self.same_block) + usize::from(self.range_overlap)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rank(&self, other: &MatchVector) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then(self.hard_agreements().cmp(&other.hard_agreements()))
            .then(self.range_overlap.cmp(&other.range_overlap))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetargetRecord {
    pub span_id: String,
    pub resolved_span_id: String,
    pub resolved_block_id: String,
    pub match_vector: MatchVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Trimmed,
    Retargeted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeakRecovery {
    pub span_id: String,
    pub outcome: RecoveryOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingResolution {
    pub ok: bool,
    /// The request with recovered preconditions and target spans rewritten.
    pub request: AiGatewayRequest,
    pub weak_recoveries: Vec<WeakRecovery>,
    pub trimming: Vec<TrimRecord>,
    pub retargeting: Vec<RetargetRecord>,
    /// Weak preconditions that failed and could not be recovered.
    pub failures: Vec<FailedPrecondition>,
}

#[derive(Debug, Clone, Copy)]
struct EffectiveTargeting {
    allow_trim: bool,
    allow_retarget: bool,
    relocate_policy: RelocatePolicy,
    min_preserved_ratio: f64,
}

impl EffectiveTargeting {
    fn new(request: &AiGatewayRequest, policy: &TargetingPolicy) -> Self {
        match &request.targeting {
            Some(options) => Self {
                allow_trim: policy.allow_trim && options.allow_trim,
                allow_retarget: policy.allow_auto_retarget && options.auto_retarget,
                relocate_policy: policy.relocate_policy.min(options.relocate_policy),
                min_preserved_ratio: policy.min_preserved_ratio,
            },
            None => Self {
                allow_trim: false,
                allow_retarget: false,
                relocate_policy: RelocatePolicy::ExactSpanOnly,
                min_preserved_ratio: policy.min_preserved_ratio,
            },
        }
    }
}

/// Check every weak precondition and try to recover the failing ones.
pub fn resolve_weak_preconditions(
    request: &AiGatewayRequest,
    provider: &dyn GatewayDocumentProvider,
    policy: &TargetingPolicy,
) -> TargetingResolution {
    let effective = EffectiveTargeting::new(request, policy);
    let mut resolved = request.clone();
    let mut weak_recoveries = Vec::new();
    let mut trimming = Vec::new();
    let mut retargeting = Vec::new();
    let mut failures = Vec::new();
    let mut rewritten: Vec<TargetPreconditionV1> = Vec::with_capacity(request.weak_preconditions().len());

    for precondition in request.weak_preconditions() {
        let (base_id, _) = parse_trimmed_span_id(&precondition.span_id);
        let state = provider.span_state(base_id);
        let Some(failure) = check_precondition_against(precondition, state.as_ref()) else {
            rewritten.push(precondition.clone());
            continue;
        };

        let recovered = match precondition.on_mismatch {
            MismatchAction::TrimRange if effective.allow_trim => {
                trim_precondition(precondition, state.as_ref(), effective.min_preserved_ratio)
                    .map(|(trimmed, record)| {
                        debug!(
                            span_id = %precondition.span_id,
                            trimmed_span_id = %record.trimmed_span_id,
                            preserved_ratio = record.preserved_ratio,
                            "weak precondition trimmed"
                        );
                        weak_recoveries.push(WeakRecovery {
                            span_id: precondition.span_id.clone(),
                            outcome: RecoveryOutcome::Trimmed,
                            detail: format!("trimmed to {}", record.trimmed_span_id),
                        });
                        trimming.push(record);
                        trimmed
                    })
            }
            MismatchAction::Relocate
                if effective.allow_retarget && effective.relocate_policy != RelocatePolicy::ExactSpanOnly =>
            {
                let candidates = provider.all_span_states();
                retarget_precondition(precondition, candidates.values(), effective.relocate_policy).map(
                    |(retargeted, record)| {
                        debug!(
                            span_id = %precondition.span_id,
                            resolved_span_id = %record.resolved_span_id,
                            "weak precondition retargeted"
                        );
                        weak_recoveries.push(WeakRecovery {
                            span_id: precondition.span_id.clone(),
                            outcome: RecoveryOutcome::Retargeted,
                            detail: format!("retargeted to {}", record.resolved_span_id),
                        });
                        retargeting.push(record);
                        retargeted
                    },
                )
            }
            _ => None,
        };

        match recovered {
            Some(updated) => {
                rewrite_target_span(&mut resolved, &precondition.span_id, &updated);
                rewritten.push(updated);
            }
            None => {
                debug!(span_id = %precondition.span_id, reason = %failure.reason, "weak precondition not recoverable");
                weak_recoveries.push(WeakRecovery {
                    span_id: precondition.span_id.clone(),
                    outcome: RecoveryOutcome::Failed,
                    detail: failure.detail.clone(),
                });
                failures.push(failure);
                rewritten.push(precondition.clone());
            }
        }
    }

    if let Some(layered) = resolved.layered_preconditions.as_mut() {
        layered.weak = rewritten;
    }

    TargetingResolution {
        ok: failures.is_empty(),
        request: resolved,
        weak_recoveries,
        trimming,
        retargeting,
        failures,
    }
}

/// Shrink the declared range to its intersection with the live span.
///
/// Requires a verified live span in the same block with known bounds, and
/// an intersection that preserves at least `min_preserved_ratio`.
pub fn trim_precondition(
    precondition: &TargetPreconditionV1,
    state: Option<&SpanState>,
    min_preserved_ratio: f64,
) -> Option<(TargetPreconditionV1, TrimRecord)> {
    let state = state.filter(|s| s.is_verified && s.block_id == precondition.block_id)?;
    let declared = precondition.range?;
    let live = state.range()?;
    let trimmed = declared.intersect(&live)?;
    if declared.is_empty() {
        return None;
    }

    let preserved_ratio = trimmed.len() as f64 / declared.len() as f64;
    if preserved_ratio < min_preserved_ratio {
        return None;
    }

    let (base_id, _) = parse_trimmed_span_id(&precondition.span_id);
    let trimmed_span_id = format_trimmed_span_id(base_id, trimmed);
    let updated = TargetPreconditionV1 {
        span_id: trimmed_span_id.clone(),
        range: Some(trimmed),
        hard: signals_of(state),
        ..precondition.clone()
    };
    let record = TrimRecord {
        span_id: precondition.span_id.clone(),
        trimmed_span_id,
        original_range: declared,
        trimmed_range: trimmed,
        original_length: declared.len(),
        trimmed_length: trimmed.len(),
        preserved_ratio,
    };
    Some((updated, record))
}

/// Pick the verified span that best agrees with the precondition.
///
/// Ranked by match vector length, then hard-signal agreements, then range
/// overlap; ties go to the smallest span id.
pub fn retarget_precondition<'a>(
    precondition: &TargetPreconditionV1,
    candidates: impl IntoIterator<Item = &'a SpanState>,
    relocate_policy: RelocatePolicy,
) -> Option<(TargetPreconditionV1, RetargetRecord)> {
    let (base_id, _) = parse_trimmed_span_id(&precondition.span_id);

    let best = candidates
        .into_iter()
        .filter(|candidate| candidate.is_verified && candidate.span_id != base_id)
        .filter(|candidate| match relocate_policy {
            RelocatePolicy::ExactSpanOnly => false,
            RelocatePolicy::SameBlock => candidate.block_id == precondition.block_id,
            RelocatePolicy::Document => true,
        })
        .map(|candidate| (candidate, match_vector(precondition, candidate)))
        .filter(|(_, vector)| vector.hard_agreements() > 0)
        .max_by(|(left, left_vector), (right, right_vector)| {
            left_vector.rank(right_vector).then_with(|| right.span_id.cmp(&left.span_id))
        })?;

    let (candidate, vector) = best;
    let updated = TargetPreconditionV1 {
        span_id: candidate.span_id.clone(),
        annotation_id: candidate.annotation_id.clone(),
        block_id: candidate.block_id.clone(),
        range: candidate.range(),
        hard: signals_of(candidate),
        ..precondition.clone()
    };
    let record = RetargetRecord {
        span_id: precondition.span_id.clone(),
        resolved_span_id: candidate.span_id.clone(),
        resolved_block_id: candidate.block_id.clone(),
        match_vector: vector,
    };
    Some((updated, record))
}

pub fn match_vector(precondition: &TargetPreconditionV1, candidate: &SpanState) -> MatchVector {
    let hard = &precondition.hard;
    let agrees = |expected: Option<&str>, actual: Option<&str>| matches!((expected, actual), (Some(e), Some(a)) if e == a);

    MatchVector {
        context_hash: hard.context_hash == candidate.context_hash,
        window_hash: agrees(hard.window_hash.as_deref(), candidate.window_hash.as_deref()),
        structure_hash: agrees(hard.structure_hash.as_deref(), candidate.structure_hash.as_deref()),
        same_block: candidate.block_id == precondition.block_id,
        range_overlap: match (precondition.range, candidate.range()) {
            (Some(declared), Some(live)) => declared.intersect(&live).is_some(),
            _ => false,
        },
    }
}

fn signals_of(state: &SpanState) -> HardSignals {
    HardSignals {
        context_hash: state.context_hash.clone(),
        window_hash: state.window_hash.clone(),
        structure_hash: state.structure_hash.clone(),
    }
}

fn rewrite_target_span(request: &mut AiGatewayRequest, span_id: &str, updated: &TargetPreconditionV1) {
    for target in request.target_spans.iter_mut().filter(|target| target.span_id == span_id) {
        target.span_id = updated.span_id.clone();
        target.annotation_id = updated.annotation_id.clone();
        target.if_match_context_hash = updated.hard.context_hash.clone();
    }
}

/// `<base>@<start>-<end>`
pub fn format_trimmed_span_id(base_id: &str, range: SpanRange) -> String {
    format!("{base_id}@{}-{}", range.start, range.end)
}

/// Split a possibly trimmed span id into its base id and trimmed range.
/// Ids without a well-formed `@start-end` suffix are returned whole.
pub fn parse_trimmed_span_id(span_id: &str) -> (&str, Option<SpanRange>) {
    let Some((base, bounds)) = span_id.rsplit_once('@') else {
        return (span_id, None);
    };
    let parsed = bounds.split_once('-').and_then(|(start, end)| {
        let start = start.parse().ok()?;
        let end = end.parse().ok()?;
        (start <= end).then_some(SpanRange { start, end })
    });
    match parsed {
        Some(range) if !base.is_empty() => (base, Some(range)),
        _ => (span_id, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{LayeredPreconditions, RequestFormat, TargetSpan, TargetingOptions};
    use crate::snapshot::DocumentSnapshot;

    fn live_span(span_id: &str, block_id: &str, hash: &str, range: (usize, usize)) -> SpanState {
        SpanState {
            span_id: span_id.into(),
            annotation_id: format!("ann-{span_id}"),
            block_id: block_id.into(),
            text: "live text".into(),
            context_hash: hash.into(),
            window_hash: Some(format!("w-{hash}")),
            structure_hash: Some("para".into()),
            is_verified: true,
            span_start: Some(range.0),
            span_end: Some(range.1),
            block_index: None,
        }
    }

    fn weak(span_id: &str, block_id: &str, hash: &str, range: (usize, usize), action: MismatchAction) -> TargetPreconditionV1 {
        TargetPreconditionV1 {
            v: 1,
            span_id: span_id.into(),
            annotation_id: format!("ann-{span_id}"),
            block_id: block_id.into(),
            range: Some(SpanRange::new(range.0, range.1)),
            hard: HardSignals { context_hash: hash.into(), window_hash: None, structure_hash: None },
            on_mismatch: action,
        }
    }

    fn request(weak_preconditions: Vec<TargetPreconditionV1>, targeting: Option<TargetingOptions>) -> AiGatewayRequest {
        AiGatewayRequest {
            doc_id: "doc".into(),
            doc_frontier_tag: "v1".into(),
            target_spans: weak_preconditions
                .iter()
                .map(|p| TargetSpan {
                    span_id: p.span_id.clone(),
                    annotation_id: p.annotation_id.clone(),
                    if_match_context_hash: p.hard.context_hash.clone(),
                })
                .collect(),
            preconditions: None,
            layered_preconditions: Some(LayeredPreconditions { strong: Vec::new(), weak: weak_preconditions }),
            targeting,
            instructions: String::new(),
            format: RequestFormat::Text,
            request_id: None,
            client_request_id: None,
        }
    }

    fn permissive() -> Option<TargetingOptions> {
        Some(TargetingOptions {
            version: 1,
            allow_trim: true,
            auto_retarget: true,
            relocate_policy: RelocatePolicy::SameBlock,
        })
    }

    // ── span ids ──

    #[test]
    fn trimmed_span_ids_round_trip() {
        let id = format_trimmed_span_id("s1", SpanRange::new(10, 20));
        assert_eq!(id, "s1@10-20");
        assert_eq!(parse_trimmed_span_id(&id), ("s1", Some(SpanRange::new(10, 20))));
    }

    #[test]
    fn plain_and_malformed_ids_are_whole() {
        assert_eq!(parse_trimmed_span_id("s1"), ("s1", None));
        assert_eq!(parse_trimmed_span_id("user@example"), ("user@example", None));
        assert_eq!(parse_trimmed_span_id("@1-2"), ("@1-2", None));
        assert_eq!(parse_trimmed_span_id("s@9-3"), ("s@9-3", None));
    }

    // ── trim ──

    #[test]
    fn trim_to_live_span_intersection() {
        let doc = DocumentSnapshot::new("doc", "v1").with_span(live_span("s1", "b1", "h-new", (10, 20)));
        let req = request(vec![weak("s1", "b1", "h-old", (8, 22), MismatchAction::TrimRange)], permissive());

        let resolution = resolve_weak_preconditions(&req, &doc, &TargetingPolicy::default());
        assert!(resolution.ok);
        let record = &resolution.trimming[0];
        assert_eq!(record.original_length, 14);
        assert_eq!(record.trimmed_length, 10);
        assert!((record.preserved_ratio - 10.0 / 14.0).abs() < 1e-9);
        assert_eq!(record.trimmed_span_id, "s1@10-20");

        let weak = &resolution.request.layered_preconditions.as_ref().unwrap().weak[0];
        assert_eq!(weak.span_id, "s1@10-20");
        assert_eq!(weak.hard.context_hash, "h-new");
        assert_eq!(resolution.request.target_spans[0].span_id, "s1@10-20");
        assert_eq!(resolution.weak_recoveries[0].outcome, RecoveryOutcome::Trimmed);
    }

    #[test]
    fn trim_respects_preserved_ratio() {
        let doc = DocumentSnapshot::new("doc", "v1").with_span(live_span("s1", "b1", "h-new", (18, 40)));
        let req = request(vec![weak("s1", "b1", "h-old", (0, 20), MismatchAction::TrimRange)], permissive());

        let resolution = resolve_weak_preconditions(&req, &doc, &TargetingPolicy::default());
        assert!(!resolution.ok);
        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.weak_recoveries[0].outcome, RecoveryOutcome::Failed);
    }

    #[test]
    fn trim_needs_request_and_policy_permission() {
        let doc = DocumentSnapshot::new("doc", "v1").with_span(live_span("s1", "b1", "h-new", (10, 20)));
        let precondition = weak("s1", "b1", "h-old", (8, 22), MismatchAction::TrimRange);

        let no_targeting = request(vec![precondition.clone()], None);
        assert!(!resolve_weak_preconditions(&no_targeting, &doc, &TargetingPolicy::default()).ok);

        let locked = TargetingPolicy { allow_trim: false, ..Default::default() };
        let req = request(vec![precondition], permissive());
        assert!(!resolve_weak_preconditions(&req, &doc, &locked).ok);
    }

    #[test]
    fn passing_weak_preconditions_need_no_recovery() {
        let doc = DocumentSnapshot::new("doc", "v1").with_span(live_span("s1", "b1", "h1", (0, 5)));
        let req = request(vec![weak("s1", "b1", "h1", (0, 5), MismatchAction::Reject)], None);
        let resolution = resolve_weak_preconditions(&req, &doc, &TargetingPolicy::default());
        assert!(resolution.ok);
        assert!(resolution.weak_recoveries.is_empty());
        assert_eq!(resolution.request, req);
    }

    // ── retarget ──

    #[test]
    fn retarget_prefers_longest_match_vector() {
        let mut stale = live_span("s1", "b1", "h-changed", (0, 10));
        stale.is_verified = false;
        let weak_match = live_span("s2", "b1", "h-old", (40, 50));
        let mut strong_match = live_span("s3", "b1", "h-old", (2, 12));
        strong_match.structure_hash = Some("para".into());
        let doc = DocumentSnapshot::new("doc", "v1").with_span(stale).with_span(weak_match).with_span(strong_match);

        let mut precondition = weak("s1", "b1", "h-old", (0, 10), MismatchAction::Relocate);
        precondition.hard.structure_hash = Some("para".into());
        let req = request(vec![precondition], permissive());

        let resolution = resolve_weak_preconditions(&req, &doc, &TargetingPolicy::default());
        assert!(resolution.ok);
        let record = &resolution.retargeting[0];
        assert_eq!(record.resolved_span_id, "s3");
        assert!(record.match_vector.range_overlap);
        assert_eq!(resolution.request.target_spans[0].span_id, "s3");
        assert_eq!(resolution.request.target_spans[0].annotation_id, "ann-s3");
    }

    #[test]
    fn retarget_ties_break_by_span_id() {
        let candidates = [live_span("sb", "b1", "h", (50, 60)), live_span("sa", "b1", "h", (70, 80))];
        let precondition = weak("s0", "b1", "h", (0, 5), MismatchAction::Relocate);
        let (updated, _) = retarget_precondition(&precondition, candidates.iter(), RelocatePolicy::SameBlock).unwrap();
        assert_eq!(updated.span_id, "sa");
    }

    #[test]
    fn retarget_requires_a_hard_signal_and_scope() {
        let other_block = live_span("s2", "b2", "h", (0, 5));
        let no_signal = live_span("s3", "b1", "different", (0, 5));
        let precondition = weak("s1", "b1", "h", (0, 5), MismatchAction::Relocate);

        assert!(retarget_precondition(&precondition, [&no_signal], RelocatePolicy::Document).is_none());
        assert!(retarget_precondition(&precondition, [&other_block], RelocatePolicy::SameBlock).is_none());
        assert!(retarget_precondition(&precondition, [&other_block], RelocatePolicy::Document).is_some());
        assert!(retarget_precondition(&precondition, [&other_block], RelocatePolicy::ExactSpanOnly).is_none());
    }
}
