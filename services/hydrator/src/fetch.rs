//! Per-entity fetch protocol
//!
//! One fetch = profile lookup + every timeline page, on leased clients.
//! Rate limits and rejected credentials are recovered here by re-leasing
//! (possibly a different client) and repeating the same request; anything
//! else fails the entity. Timeline retries resume from the current cursor.

use std::sync::Arc;

use remote::{
    ApiError, EndpointCategory, EntityId, ErrorClassification, PageCursor, Post, Profile,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use twitter_pool::{ClientLease, Pool, classify};

use crate::metrics;

/// Final status of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Failure(String),
    /// Shutdown arrived while waiting for a client.
    Interrupted,
}

impl FetchStatus {
    /// Status-log text: `Done` on success, otherwise the reason.
    pub fn label(&self) -> &str {
        match self {
            FetchStatus::Success => "Done",
            FetchStatus::Failure(reason) => reason,
            FetchStatus::Interrupted => "interrupted before completion",
        }
    }

    /// Metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Failure(_) => "failure",
            FetchStatus::Interrupted => "interrupted",
        }
    }
}

/// Result of fetching one entity.
///
/// `profile` and `timeline` are only set on success.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub entity: EntityId,
    pub status: FetchStatus,
    pub profile: Option<Profile>,
    pub timeline: Option<Vec<Post>>,
}

impl FetchOutcome {
    pub fn success(entity: EntityId, profile: Profile, timeline: Vec<Post>) -> Self {
        Self {
            entity,
            status: FetchStatus::Success,
            profile: Some(profile),
            timeline: Some(timeline),
        }
    }

    pub fn failure(entity: EntityId, status: FetchStatus) -> Self {
        Self {
            entity,
            status,
            profile: None,
            timeline: None,
        }
    }
}

/// Why a fetch did not complete.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The remote refused this entity; the message is the remote's own.
    #[error("{0}")]
    Entity(ApiError),

    #[error("rate limit retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("{0}")]
    Pool(#[from] twitter_pool::Error),

    #[error("interrupted before completion")]
    Interrupted,
}

/// Fetches entities on clients leased from the pool.
pub struct Fetcher {
    pool: Arc<Pool>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(pool: Arc<Pool>, max_retries: u32, cancel: CancellationToken) -> Self {
        Self {
            pool,
            max_retries,
            cancel,
        }
    }

    /// Fetch one entity end to end. Never fails: errors become the outcome's status.
    pub async fn fetch(&self, entity: EntityId) -> FetchOutcome {
        let span = info_span!("fetch", entity = %entity);
        let result = self.try_fetch(&entity).instrument(span).await;
        match result {
            Ok((profile, timeline)) => {
                debug!(entity = %entity, posts = timeline.len(), "entity hydrated");
                FetchOutcome::success(entity, profile, timeline)
            }
            Err(FetchError::Interrupted) => FetchOutcome::failure(entity, FetchStatus::Interrupted),
            Err(e) => {
                warn!(entity = %entity, error = %e, "entity failed");
                FetchOutcome::failure(entity, FetchStatus::Failure(e.to_string()))
            }
        }
    }

    async fn try_fetch(&self, entity: &EntityId) -> Result<(Profile, Vec<Post>), FetchError> {
        let mut attempts = 0u32;

        let mut lease = self.lease(EndpointCategory::ProfileLookup).await?;
        let profile = loop {
            let result = lease.api().get_profile(entity).await;
            match result {
                Ok(response) => {
                    lease.record(EndpointCategory::ProfileLookup, response.rate_limit);
                    break response.body;
                }
                Err(e) => {
                    self.recover(&lease, EndpointCategory::ProfileLookup, e, &mut attempts)?;
                    drop(lease);
                    lease = self.lease(EndpointCategory::ProfileLookup).await?;
                }
            }
        };

        if !lease.has_quota(EndpointCategory::TimelineLookup) {
            drop(lease);
            lease = self.lease(EndpointCategory::TimelineLookup).await?;
        }

        let mut posts = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        loop {
            let result = lease.api().timeline_page(entity, cursor.as_ref()).await;
            match result {
                Ok(response) => {
                    lease.record(EndpointCategory::TimelineLookup, response.rate_limit);
                    let page = response.body;
                    if page.posts.is_empty() {
                        break;
                    }
                    posts.extend(page.posts);
                    match page.next {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    self.recover(&lease, EndpointCategory::TimelineLookup, e, &mut attempts)?;
                    drop(lease);
                    lease = self.lease(EndpointCategory::TimelineLookup).await?;
                }
            }
        }

        Ok((profile, posts))
    }

    /// Decide whether a failed call may be repeated on a fresh lease.
    fn recover(
        &self,
        lease: &ClientLease,
        category: EndpointCategory,
        error: ApiError,
        attempts: &mut u32,
    ) -> Result<(), FetchError> {
        let classification = classify(&error);
        metrics::record_remote_error(classification);

        match classification {
            ErrorClassification::EntityFailure => Err(FetchError::Entity(error)),
            ErrorClassification::RateLimited | ErrorClassification::CredentialRejected => {
                lease.report_error(category, classification, error.reset_in());
                *attempts += 1;
                if *attempts > self.max_retries {
                    return Err(FetchError::RetriesExhausted(*attempts));
                }
                debug!(
                    client = lease.id(),
                    category = %category,
                    classification = classification.label(),
                    attempt = *attempts,
                    "retrying on a fresh lease"
                );
                Ok(())
            }
        }
    }

    /// Lease a client, giving up when the run is cancelled.
    async fn lease(&self, category: EndpointCategory) -> Result<ClientLease, FetchError> {
        tokio::select! {
            biased;
            lease = self.pool.acquire(category) => Ok(lease?),
            () = self.cancel.cancelled() => Err(FetchError::Interrupted),
        }
    }
}
