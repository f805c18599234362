// Wire types for the AI gateway: requests, preconditions and 409 payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-side truth for one span. Owned by the document provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanState {
    pub span_id: String,
    pub annotation_id: String,
    pub block_id: String,
    pub text: String,
    pub context_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_hash: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<usize>,
}

impl SpanState {
    /// Live `[start, end)` bounds, when the provider tracks them.
    pub fn range(&self) -> Option<SpanRange> {
        match (self.span_start, self.span_end) {
            (Some(start), Some(end)) if start <= end => Some(SpanRange { start, end }),
            _ => None,
        }
    }
}

/// Legacy precondition: one expected context hash per span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSpan {
    pub span_id: String,
    pub annotation_id: String,
    pub if_match_context_hash: String,
}

/// Half-open char range inside a block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SpanRange {
    pub start: usize,
    pub end: usize,
}

impl SpanRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn intersect(&self, other: &SpanRange) -> Option<SpanRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(SpanRange { start, end })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardSignals {
    pub context_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_hash: Option<String>,
}

/// What a weak precondition may do when its hard signals fail.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MismatchAction {
    #[default]
    Reject,
    TrimRange,
    Relocate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetPreconditionV1 {
    #[serde(default = "precondition_version")]
    pub v: u8,
    pub span_id: String,
    pub annotation_id: String,
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<SpanRange>,
    pub hard: HardSignals,
    #[serde(default)]
    pub on_mismatch: MismatchAction,
}

fn precondition_version() -> u8 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayeredPreconditions {
    #[serde(default)]
    pub strong: Vec<TargetPreconditionV1>,
    #[serde(default)]
    pub weak: Vec<TargetPreconditionV1>,
}

/// How far a retarget may look for a replacement span. Ordered from the
/// narrowest scope to the widest.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RelocatePolicy {
    #[default]
    ExactSpanOnly,
    SameBlock,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetingOptions {
    #[serde(default = "precondition_version")]
    pub version: u8,
    #[serde(default)]
    pub allow_trim: bool,
    #[serde(default)]
    pub auto_retarget: bool,
    #[serde(default)]
    pub relocate_policy: RelocatePolicy,
}

impl Default for TargetingOptions {
    fn default() -> Self {
        Self {
            version: precondition_version(),
            allow_trim: false,
            auto_retarget: false,
            relocate_policy: RelocatePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestFormat {
    #[default]
    Html,
    Markdown,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiGatewayRequest {
    pub doc_id: String,
    pub doc_frontier_tag: String,
    #[serde(default)]
    pub target_spans: Vec<TargetSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Vec<TargetPreconditionV1>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layered_preconditions: Option<LayeredPreconditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<TargetingOptions>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub format: RequestFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
}

impl AiGatewayRequest {
    /// Whether the request uses v1 preconditions instead of `target_spans`.
    pub fn uses_v1_preconditions(&self) -> bool {
        self.preconditions.is_some() || self.layered_preconditions.is_some()
    }

    /// Preconditions that must hold exactly: `preconditions` followed by
    /// `layered_preconditions.strong`.
    pub fn strong_preconditions(&self) -> impl Iterator<Item = &TargetPreconditionV1> {
        let flat = self.preconditions.iter().flatten();
        let layered = self.layered_preconditions.iter().flat_map(|layered| layered.strong.iter());
        flat.chain(layered)
    }

    pub fn weak_preconditions(&self) -> &[TargetPreconditionV1] {
        self.layered_preconditions.as_ref().map(|layered| layered.weak.as_slice()).unwrap_or(&[])
    }

    /// Assign a fresh request id if the caller did not provide one.
    pub fn ensure_request_id(&mut self) -> &str {
        self.request_id.get_or_insert_with(|| Uuid::new_v4().to_string())
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    SpanMissing,
    HashMismatch,
    UnverifiedTarget,
    FrontierMismatch,
    SchemaReject,
    SanitizationReject,
}

impl ConflictReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpanMissing => "span_missing",
            Self::HashMismatch => "hash_mismatch",
            Self::UnverifiedTarget => "unverified_target",
            Self::FrontierMismatch => "frontier_mismatch",
            Self::SchemaReject => "schema_reject",
            Self::SanitizationReject => "sanitization_reject",
        }
    }

    /// Target drift can be retried; invalid content cannot.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::FrontierMismatch | Self::HashMismatch | Self::UnverifiedTarget | Self::SpanMissing
        )
    }

    /// Failures the relocation engine can try to repair.
    pub const fn is_relocatable(self) -> bool {
        matches!(self, Self::HashMismatch | Self::SpanMissing)
    }

    /// Rank used to pick the primary reason among span failures. Higher wins.
    pub(crate) const fn precondition_priority(self) -> u8 {
        match self {
            Self::UnverifiedTarget => 3,
            Self::HashMismatch => 2,
            Self::SpanMissing => 1,
            _ => 0,
        }
    }

    const fn summary_label(self) -> &'static str {
        match self {
            Self::SpanMissing => "missing",
            Self::HashMismatch => "hash mismatch",
            Self::UnverifiedTarget => "unverified",
            Self::FrontierMismatch => "frontier mismatch",
            Self::SchemaReject => "schema reject",
            Self::SanitizationReject => "sanitization reject",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedPrecondition {
    pub span_id: String,
    pub annotation_id: String,
    pub reason: ConflictReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hash: Option<String>,
    pub detail: String,
}

impl FailedPrecondition {
    pub fn missing(span_id: &str, annotation_id: &str) -> Self {
        Self {
            span_id: span_id.to_string(),
            annotation_id: annotation_id.to_string(),
            reason: ConflictReason::SpanMissing,
            expected_hash: None,
            actual_hash: None,
            detail: format!("Span {span_id} not found"),
        }
    }

    pub fn unverified(span_id: &str, annotation_id: &str) -> Self {
        Self {
            span_id: span_id.to_string(),
            annotation_id: annotation_id.to_string(),
            reason: ConflictReason::UnverifiedTarget,
            expected_hash: None,
            actual_hash: None,
            detail: format!("Span {span_id} is not verified"),
        }
    }

    pub fn hash_mismatch(
        span_id: &str,
        annotation_id: &str,
        expected: Option<&str>,
        actual: Option<&str>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            span_id: span_id.to_string(),
            annotation_id: annotation_id.to_string(),
            reason: ConflictReason::HashMismatch,
            expected_hash: expected.map(str::to_string),
            actual_hash: actual.map(str::to_string),
            detail: detail.into(),
        }
    }
}

pub const CONFLICT_STATUS: u16 = 409;

/// The 409 body returned for every rejected request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictResponse {
    pub status: u16,
    pub reason: ConflictReason,
    pub server_frontier_tag: String,
    #[serde(default)]
    pub failed_preconditions: Vec<FailedPrecondition>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
}

impl ConflictResponse {
    fn for_request(
        request: &AiGatewayRequest,
        reason: ConflictReason,
        server_frontier_tag: &str,
        failed_preconditions: Vec<FailedPrecondition>,
        message: String,
    ) -> Self {
        Self {
            status: CONFLICT_STATUS,
            reason,
            server_frontier_tag: server_frontier_tag.to_string(),
            failed_preconditions,
            message,
            request_id: request.request_id.clone(),
            client_request_id: request.client_request_id.clone(),
        }
    }

    pub fn document_missing(request: &AiGatewayRequest) -> Self {
        Self::for_request(
            request,
            ConflictReason::SpanMissing,
            "",
            Vec::new(),
            format!("Document not found: {}", request.doc_id),
        )
    }

    pub fn frontier_mismatch(
        request: &AiGatewayRequest,
        server_frontier_tag: &str,
        ordering: crate::frontier::FrontierOrdering,
    ) -> Self {
        Self::for_request(
            request,
            ConflictReason::FrontierMismatch,
            server_frontier_tag,
            Vec::new(),
            format!(
                "Frontier mismatch: client {} is {ordering} server {server_frontier_tag}",
                request.doc_frontier_tag
            ),
        )
    }

    /// Build the 409 for one or more span failures. Returns `None` when
    /// `failures` is empty.
    pub fn from_failures(
        request: &AiGatewayRequest,
        server_frontier_tag: &str,
        failures: Vec<FailedPrecondition>,
    ) -> Option<Self> {
        let reason = primary_reason(&failures)?;
        let message = failure_message(&failures);
        Some(Self::for_request(request, reason, server_frontier_tag, failures, message))
    }

    /// Non-retryable rejection produced by the content dry-run pipeline.
    pub fn content_rejected(
        request: &AiGatewayRequest,
        server_frontier_tag: &str,
        reason: ConflictReason,
        detail: impl Into<String>,
    ) -> Self {
        let detail = detail.into();
        let message = match reason {
            ConflictReason::SanitizationReject => format!("Sanitization rejected content: {detail}"),
            _ => format!("Schema validation rejected content: {detail}"),
        };
        Self::for_request(request, reason, server_frontier_tag, Vec::new(), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

/// `unverified_target > hash_mismatch > span_missing`.
pub fn primary_reason(failures: &[FailedPrecondition]) -> Option<ConflictReason> {
    failures.iter().map(|failure| failure.reason).max_by_key(|reason| reason.precondition_priority())
}

fn failure_message(failures: &[FailedPrecondition]) -> String {
    if let [single] = failures {
        return single.detail.clone();
    }

    [ConflictReason::UnverifiedTarget, ConflictReason::HashMismatch, ConflictReason::SpanMissing]
        .into_iter()
        .filter_map(|reason| {
            let count = failures.iter().filter(|failure| failure.reason == reason).count();
            (count > 0).then(|| format!("{count} {}", reason.summary_label()))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
