use serde::{Deserialize, Serialize};

/// A typed Gateway (or content-store) HTTP error carrying enough to
/// classify it, per spec.md §9 ("Replace [untyped errors] with tagged
/// variants ... consumes a typed error carrying `{httpStatus, body, code}`").
#[derive(Debug, Clone)]
pub struct RawHttpError {
    pub http_status: u16,
    pub body: String,
    pub code: Option<String>,
}

impl RawHttpError {
    pub fn new(http_status: u16, body: impl Into<String>) -> Self {
        Self {
            http_status,
            body: truncate_body(body.into()),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Caps retained error bodies so a chatty failing peer can't grow our
/// memory footprint (spec.md §4.1 "memory-safety contract").
const MAX_RETAINED_BODY_BYTES: usize = 4096;

fn truncate_body(body: String) -> String {
    if body.len() <= MAX_RETAINED_BODY_BYTES {
        return body;
    }
    let mut truncated: String = body.chars().take(MAX_RETAINED_BODY_BYTES).collect();
    truncated.push_str("...<truncated>");
    truncated
}

/// The taxonomy a lower layer classifies into; C9 alone decides what to do
/// with a given kind (spec.md §7 "Propagation rule").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Timeouts, DNS, refused, 5xx, 429: retryable.
    TransientNetwork,
    /// Claim/finish denied because another worker owns the job: terminal,
    /// suppress failure reporting.
    RaceLost,
    /// Opaque 500 during claim: requires a forensic Status probe.
    Ambiguous,
    /// 400/409 explaining an invalid state: terminal, report only if we
    /// previously owned the job.
    StateConflict,
    /// Probe rejects the input, or the encoder exhausts the codec cascade:
    /// terminal, report failure.
    InputMediaFatal,
    /// Encoder process timeout/signal/exit!=0 on a single codec attempt:
    /// the cascade advances to the next codec within the same attempt.
    EncoderProcess,
    /// Content-store upload 5xx/timeouts: retryable up to 3x with backoff.
    ContentStoreTransient,
    /// Pin failure: never fatal, recorded for lazy retry.
    PinningFailure,
    /// Database unavailable: downgrades fallbacks to "not enabled", never
    /// poisons the job.
    DatabaseUnavailable,
    /// Gateway responded successfully but reports the finish as a
    /// duplicate of one we (or a prior attempt) already reported.
    DuplicateCompletion,
}

/// Keyword fragments the Gateway is known to embed in 4xx/5xx bodies for
/// claim/finish conflicts (spec.md §4.1). Matching is case-insensitive.
const RACE_LOST_KEYWORDS: &[&str] = &["already", "accepted", "not assigned", "invalid state"];

/// Classifies a Gateway `Claim` failure.
pub fn classify_claim_error(err: &RawHttpError) -> ErrorKind {
    if err.http_status == 500 {
        return ErrorKind::Ambiguous;
    }
    if matches!(err.http_status, 400 | 401 | 403 | 404 | 409 | 422) {
        if body_matches_keywords(&err.body) {
            return ErrorKind::RaceLost;
        }
        return ErrorKind::StateConflict;
    }
    if is_infrastructure_status(err.http_status) {
        return ErrorKind::TransientNetwork;
    }
    ErrorKind::StateConflict
}

/// Classifies a Gateway `Finish` failure.
pub fn classify_finish_error(err: &RawHttpError) -> ErrorKind {
    if err.http_status == 500 {
        if body_matches_keywords(&err.body) {
            return ErrorKind::DuplicateCompletion;
        }
        return ErrorKind::Ambiguous;
    }
    if matches!(err.http_status, 400 | 401 | 403 | 404 | 409 | 422) {
        if body_matches_keywords(&err.body) {
            return ErrorKind::RaceLost;
        }
        return ErrorKind::StateConflict;
    }
    if is_infrastructure_status(err.http_status) {
        return ErrorKind::TransientNetwork;
    }
    ErrorKind::StateConflict
}

fn body_matches_keywords(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    RACE_LOST_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn is_infrastructure_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_409_already_assigned_is_race_lost() {
        let err = RawHttpError::new(409, "Job already assigned to another encoder");
        assert_eq!(classify_claim_error(&err), ErrorKind::RaceLost);
    }

    #[test]
    fn claim_409_without_keywords_is_state_conflict() {
        let err = RawHttpError::new(409, "malformed request body");
        assert_eq!(classify_claim_error(&err), ErrorKind::StateConflict);
    }

    #[test]
    fn claim_500_is_ambiguous_not_race_lost() {
        let err = RawHttpError::new(500, "internal server error");
        assert_eq!(classify_claim_error(&err), ErrorKind::Ambiguous);
    }

    #[test]
    fn claim_503_is_transient_network() {
        let err = RawHttpError::new(503, "upstream unavailable");
        assert_eq!(classify_claim_error(&err), ErrorKind::TransientNetwork);
    }

    #[test]
    fn finish_500_with_keywords_is_duplicate_completion() {
        let err = RawHttpError::new(500, "job not assigned to this encoder, already accepted");
        assert_eq!(classify_finish_error(&err), ErrorKind::DuplicateCompletion);
    }

    #[test]
    fn finish_500_without_keywords_is_ambiguous() {
        let err = RawHttpError::new(500, "unexpected database error");
        assert_eq!(classify_finish_error(&err), ErrorKind::Ambiguous);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let err = RawHttpError::new(409, "ALREADY ACCEPTED");
        assert_eq!(classify_claim_error(&err), ErrorKind::RaceLost);
    }

    #[test]
    fn body_beyond_cap_is_truncated() {
        let body: String = "x".repeat(MAX_RETAINED_BODY_BYTES + 500);
        let err = RawHttpError::new(502, body);
        assert!(err.body.len() < MAX_RETAINED_BODY_BYTES + 500);
        assert!(err.body.ends_with("...<truncated>"));
    }
}
