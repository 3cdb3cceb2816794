//! Remote API abstraction for entity hydration
//!
//! Defines the `TimelineApi` trait that decouples the pool, fetcher and
//! dispatcher from the concrete HTTP client and its authentication scheme.
//! The binary implements it on top of `reqwest`; tests implement it in memory
//! (see the `testing` feature).
//!
//! Every response carries the rate-limit snapshot the remote reported for the
//! call, so the pool can keep per-client, per-category windows without a
//! separate status request.

pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use types::{
    EndpointCategory, EntityId, PageCursor, Post, Profile, RateLimitSnapshot, Response,
    TimelinePage,
};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by `TimelineApi` methods (keeps the trait dyn-compatible).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classification of remote errors to determine the recovery strategy.
///
/// - RateLimited: mark the client's window exhausted, retry on another client
///   or after the reset
/// - CredentialRejected: the client's credentials are invalid, disable it and
///   retry the request elsewhere
/// - EntityFailure: the entity itself cannot be hydrated (not found,
///   suspended, protected, broken response); record a failure and move on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    RateLimited,
    CredentialRejected,
    EntityFailure,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::CredentialRejected => "credential_rejected",
            ErrorClassification::EntityFailure => "entity_failure",
        }
    }
}

/// Errors surfaced by a `TimelineApi` call.
///
/// `Display` is the description written to the status log, so `Remote`
/// renders the API's own message verbatim (`User not found.`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Per-credential rate limit exceeded for the called category.
    #[error("Rate limit exceeded")]
    RateLimited { reset_in: Option<Duration> },

    /// Error payload returned by the remote API.
    #[error("{message}")]
    Remote {
        status: u16,
        code: Option<u32>,
        message: String,
    },

    /// The client could not authenticate (token exchange or signing failed).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The response body did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Seconds-to-reset hint carried by a rate-limit error.
    pub fn reset_in(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { reset_in } => *reset_in,
            _ => None,
        }
    }
}

/// Result alias for remote calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// One authenticated client of the remote API.
///
/// Implementations must be cheap to share (`Arc<dyn TimelineApi>`); the pool
/// guarantees a client serves at most one fetch at a time, but the periodic
/// rate-limit sync may call `rate_limit_status` concurrently with a fetch.
pub trait TimelineApi: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "app:abc123").
    fn id(&self) -> &str;

    /// Look up one entity's profile (`EndpointCategory::ProfileLookup`).
    fn get_profile<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, Result<Response<Profile>>>;

    /// Fetch one page of the entity's timeline (`EndpointCategory::TimelineLookup`).
    ///
    /// `cursor` is `None` for the newest page; the returned page's `next`
    /// is `None` once the timeline is exhausted.
    fn timeline_page<'a>(
        &'a self,
        entity: &'a EntityId,
        cursor: Option<&'a PageCursor>,
    ) -> BoxFuture<'a, Result<Response<TimelinePage>>>;

    /// Live rate-limit windows for every category this client serves.
    fn rate_limit_status(&self) -> BoxFuture<'_, Result<Vec<(EndpointCategory, RateLimitSnapshot)>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_api_message_verbatim() {
        let err = ApiError::Remote {
            status: 404,
            code: Some(50),
            message: "User not found.".into(),
        };
        assert_eq!(err.to_string(), "User not found.");
    }

    #[test]
    fn reset_hint_only_on_rate_limit() {
        let limited = ApiError::RateLimited {
            reset_in: Some(Duration::from_secs(30)),
        };
        assert_eq!(limited.reset_in(), Some(Duration::from_secs(30)));
        assert_eq!(ApiError::Http("timeout".into()).reset_in(), None);
    }

    #[test]
    fn classification_labels() {
        assert_eq!(ErrorClassification::RateLimited.label(), "rate_limited");
        assert_eq!(
            ErrorClassification::CredentialRejected.label(),
            "credential_rejected"
        );
        assert_eq!(ErrorClassification::EntityFailure.label(), "entity_failure");
    }
}
