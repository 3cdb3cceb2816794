//! In-memory `TimelineApi` for tests.
//!
//! `ScriptedApi` serves profiles and paged timelines from maps, can be told
//! to fail specific calls, and records how many calls were in flight at once
//! so concurrency bounds can be asserted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::{
    ApiError, BoxFuture, EndpointCategory, EntityId, PageCursor, Post, Profile,
    RateLimitSnapshot, Response, Result, TimelineApi, TimelinePage,
};

/// Concurrent call tracker, shareable between several scripted clients.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total calls observed.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Build a profile with the fields the aggregations read.
pub fn profile(id: u64, screen_name: &str) -> Profile {
    serde_json::from_value(json!({
        "id": id,
        "screen_name": screen_name,
        "name": screen_name.to_uppercase(),
        "lang": "en",
        "followers_count": id * 10,
        "statuses_count": 2,
        "description": format!("profile of {screen_name}"),
    }))
    .expect("static profile json")
}

/// Build a post with the given id and text.
pub fn post(id: u64, text: &str) -> Post {
    serde_json::from_value(json!({
        "id": id,
        "full_text": text,
        "created_at": "Mon Jan 01 00:00:00 +0000 2024",
    }))
    .expect("static post json")
}

#[derive(Default)]
struct Script {
    profiles: HashMap<String, Profile>,
    pages: HashMap<String, Vec<Vec<Post>>>,
    profile_errors: HashMap<String, VecDeque<ApiError>>,
    page_errors: HashMap<String, VecDeque<(usize, ApiError)>>,
    status: Vec<(EndpointCategory, RateLimitSnapshot)>,
    status_error: Option<ApiError>,
}

/// Scripted client. Unknown entities answer `User not found.`.
pub struct ScriptedApi {
    id: String,
    script: Mutex<Script>,
    delay: Duration,
    rate_limit: Option<RateLimitSnapshot>,
    in_flight: Arc<InFlight>,
    profile_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(Script::default()),
            delay: Duration::ZERO,
            rate_limit: None,
            in_flight: InFlight::new(),
            profile_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    /// Serve `profile` and `pages` (newest page first) for `entity`.
    pub fn with_entity(self, entity: impl Into<EntityId>, profile: Profile, pages: Vec<Vec<Post>>) -> Self {
        let key = entity.into().to_string();
        {
            let mut script = self.lock();
            script.profiles.insert(key.clone(), profile);
            script.pages.insert(key, pages);
        }
        self
    }

    /// Fail the next profile lookup for `entity` with `error` (queued, FIFO).
    pub fn fail_profile(self, entity: impl Into<EntityId>, error: ApiError) -> Self {
        self.lock()
            .profile_errors
            .entry(entity.into().to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Fail the next request for page `page` of `entity` with `error`.
    pub fn fail_page(self, entity: impl Into<EntityId>, page: usize, error: ApiError) -> Self {
        self.lock()
            .page_errors
            .entry(entity.into().to_string())
            .or_default()
            .push_back((page, error));
        self
    }

    /// Answer `rate_limit_status` with these windows.
    pub fn with_status(self, status: Vec<(EndpointCategory, RateLimitSnapshot)>) -> Self {
        self.lock().status = status;
        self
    }

    /// Answer `rate_limit_status` with an error.
    pub fn with_status_error(self, error: ApiError) -> Self {
        self.lock().status_error = Some(error);
        self
    }

    /// Attach this snapshot to every successful response.
    pub fn with_rate_limit(mut self, snapshot: RateLimitSnapshot) -> Self {
        self.rate_limit = Some(snapshot);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Share a concurrency tracker with other clients.
    pub fn with_tracker(mut self, tracker: Arc<InFlight>) -> Self {
        self.in_flight = tracker;
        self
    }

    pub fn tracker(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond<T>(&self, body: T) -> Response<T> {
        match self.rate_limit {
            Some(snapshot) => Response::new(body).with_rate_limit(snapshot),
            None => Response::new(body),
        }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

fn not_found() -> ApiError {
    ApiError::Remote {
        status: 404,
        code: Some(50),
        message: "User not found.".into(),
    }
}

impl TimelineApi for ScriptedApi {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_profile<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, Result<Response<Profile>>> {
        Box::pin(async move {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            self.in_flight.enter();
            self.pause().await;
            let key = entity.to_string();
            let result = {
                let mut script = self.lock();
                match script.profile_errors.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(error) => Err(error),
                    None => script.profiles.get(&key).cloned().ok_or_else(not_found),
                }
            };
            self.in_flight.exit();
            result.map(|profile| self.respond(profile))
        })
    }

    fn timeline_page<'a>(
        &'a self,
        entity: &'a EntityId,
        cursor: Option<&'a PageCursor>,
    ) -> BoxFuture<'a, Result<Response<TimelinePage>>> {
        Box::pin(async move {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            self.in_flight.enter();
            self.pause().await;
            let key = entity.to_string();
            let index = match cursor {
                Some(c) => c.0.parse::<usize>().unwrap_or(usize::MAX),
                None => 0,
            };
            let result = {
                let mut script = self.lock();
                let scripted_error = script.page_errors.get_mut(&key).and_then(|queue| {
                    let position = queue.iter().position(|(page, _)| *page == index)?;
                    queue.remove(position).map(|(_, error)| error)
                });
                match scripted_error {
                    Some(error) => Err(error),
                    None => match script.pages.get(&key) {
                        Some(pages) => {
                            let posts = pages.get(index).cloned().unwrap_or_default();
                            let next = (!posts.is_empty()).then(|| PageCursor((index + 1).to_string()));
                            Ok(TimelinePage { posts, next })
                        }
                        None => Err(not_found()),
                    },
                }
            };
            self.in_flight.exit();
            result.map(|page| self.respond(page))
        })
    }

    fn rate_limit_status(&self) -> BoxFuture<'_, Result<Vec<(EndpointCategory, RateLimitSnapshot)>>> {
        Box::pin(async move {
            let script = self.lock();
            match &script.status_error {
                Some(error) => Err(error.clone()),
                None => Ok(script.status.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_pages_until_empty() {
        let api = ScriptedApi::new("a").with_entity(
            42u64,
            profile(42, "x"),
            vec![vec![post(3, "c"), post(2, "b")], vec![post(1, "a")]],
        );
        let entity = EntityId::Numeric(42);

        let first = api.timeline_page(&entity, None).await.unwrap().body;
        assert_eq!(first.posts.len(), 2);
        let second = api
            .timeline_page(&entity, first.next.as_ref())
            .await
            .unwrap()
            .body;
        assert_eq!(second.posts.len(), 1);
        let last = api
            .timeline_page(&entity, second.next.as_ref())
            .await
            .unwrap()
            .body;
        assert!(last.posts.is_empty());
        assert!(last.next.is_none());
        assert_eq!(api.page_calls(), 3);
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let api = ScriptedApi::new("a");
        let err = api.get_profile(&EntityId::Numeric(99)).await.unwrap_err();
        assert_eq!(err.to_string(), "User not found.");
    }

    #[tokio::test]
    async fn scripted_errors_fire_once() {
        let api = ScriptedApi::new("a")
            .with_entity(1u64, profile(1, "a"), vec![])
            .fail_profile(1u64, ApiError::RateLimited { reset_in: None });
        let entity = EntityId::Numeric(1);
        assert!(api.get_profile(&entity).await.is_err());
        assert!(api.get_profile(&entity).await.is_ok());
    }
}
