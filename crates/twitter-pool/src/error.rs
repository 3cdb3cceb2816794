//! Error types for pool operations

use remote::EndpointCategory;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup with zero configured clients.
    #[error("no API clients configured")]
    Empty,

    /// Every client has been disabled. Shown verbatim in status lines.
    #[error("pool exhausted: every API client disabled ({clients_total} configured)")]
    Exhausted { clients_total: usize },

    /// The reset-wait budget ran out before any client regained quota.
    #[error("no {category} quota after waiting for {waits} rate-limit resets")]
    QuotaWaitExhausted {
        category: EndpointCategory,
        waits: u32,
    },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
