//! Error classification for remote API responses
//!
//! Distinguishes rate limiting (retry on another client or after the reset),
//! rejected credentials (disable the client) and entity-level failures
//! (record and move on). Only the first two ever touch pool state.

use remote::{ApiError, ErrorClassification};

/// API error codes meaning the calling credential hit its rate limit.
const RATE_LIMIT_CODES: &[u32] = &[88];

/// API error codes meaning the calling credential itself is unusable:
/// could not authenticate (32), account suspended (64), invalid or expired
/// token (89), bad authentication data (215), account locked (326).
const CREDENTIAL_CODES: &[u32] = &[32, 64, 89, 215, 326];

/// Classify an API error payload by HTTP status and API error code.
///
/// 429 and code 88 are rate limits. The credential codes disable the
/// client. Everything else, including a bare 401 (protected timeline) and
/// 404/403 (not found, suspended entity), is an entity failure.
pub fn classify_status(status: u16, code: Option<u32>) -> ErrorClassification {
    if status == 429 || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
        return ErrorClassification::RateLimited;
    }
    if code.is_some_and(|c| CREDENTIAL_CODES.contains(&c)) {
        return ErrorClassification::CredentialRejected;
    }
    ErrorClassification::EntityFailure
}

/// Classify any error a `TimelineApi` call can return.
pub fn classify(error: &ApiError) -> ErrorClassification {
    match error {
        ApiError::RateLimited { .. } => ErrorClassification::RateLimited,
        ApiError::Remote { status, code, .. } => classify_status(*status, *code),
        ApiError::Auth(_) => ErrorClassification::CredentialRejected,
        ApiError::Http(_) | ApiError::Decode(_) => ErrorClassification::EntityFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        assert_eq!(classify_status(429, None), ErrorClassification::RateLimited);
    }

    #[test]
    fn code_88_is_rate_limited_regardless_of_status() {
        assert_eq!(
            classify_status(400, Some(88)),
            ErrorClassification::RateLimited
        );
    }

    #[test]
    fn invalid_token_disables_credential() {
        assert_eq!(
            classify_status(401, Some(89)),
            ErrorClassification::CredentialRejected
        );
        assert_eq!(
            classify_status(401, Some(32)),
            ErrorClassification::CredentialRejected
        );
        assert_eq!(
            classify_status(403, Some(326)),
            ErrorClassification::CredentialRejected
        );
    }

    #[test]
    fn protected_timeline_is_entity_failure() {
        assert_eq!(
            classify_status(401, None),
            ErrorClassification::EntityFailure
        );
    }

    #[test]
    fn not_found_and_suspended_entities_fail_the_entity() {
        assert_eq!(
            classify_status(404, Some(50)),
            ErrorClassification::EntityFailure
        );
        assert_eq!(
            classify_status(403, Some(63)),
            ErrorClassification::EntityFailure
        );
    }

    #[test]
    fn server_errors_fail_the_entity() {
        assert_eq!(
            classify_status(503, Some(130)),
            ErrorClassification::EntityFailure
        );
    }

    #[test]
    fn classify_maps_every_variant() {
        assert_eq!(
            classify(&ApiError::RateLimited { reset_in: None }),
            ErrorClassification::RateLimited
        );
        assert_eq!(
            classify(&ApiError::Auth("bad signature".into())),
            ErrorClassification::CredentialRejected
        );
        assert_eq!(
            classify(&ApiError::Http("connection reset".into())),
            ErrorClassification::EntityFailure
        );
        assert_eq!(
            classify(&ApiError::Decode("expected object".into())),
            ErrorClassification::EntityFailure
        );
        assert_eq!(
            classify(&ApiError::Remote {
                status: 404,
                code: Some(50),
                message: "User not found.".into()
            }),
            ErrorClassification::EntityFailure
        );
    }
}
