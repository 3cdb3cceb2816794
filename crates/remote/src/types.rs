//! Data model shared by the pool, the fetcher and the writer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque entity identifier as read from one input line.
///
/// Input files carry either numeric (`{"id": 42}`) or string
/// (`{"id": "42"}`) ids; the original JSON type is kept so records written
/// back out use the same representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Numeric(u64),
    Text(String),
}

impl EntityId {
    /// Numeric value when the id is, or spells, an unsigned integer.
    pub fn as_numeric(&self) -> Option<u64> {
        match self {
            EntityId::Numeric(n) => Some(*n),
            EntityId::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Numeric(n) => write!(f, "{n}"),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        EntityId::Numeric(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

/// Endpoint families with independent per-credential rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    ProfileLookup,
    TimelineLookup,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 2] = [
        EndpointCategory::ProfileLookup,
        EndpointCategory::TimelineLookup,
    ];

    /// Dense index for per-category arrays.
    pub fn index(self) -> usize {
        match self {
            EndpointCategory::ProfileLookup => 0,
            EndpointCategory::TimelineLookup => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EndpointCategory::ProfileLookup => "profile_lookup",
            EndpointCategory::TimelineLookup => "timeline_lookup",
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An entity's profile.
///
/// The typed fields are the ones the compact aggregation needs; everything
/// else the API returned is kept in `raw` so the complete aggregation can
/// write the profile back out in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u64,
    pub screen_name: String,
    /// Display name
    pub name: String,
    #[serde(default)]
    pub lang: Option<String>,
    pub followers_count: u64,
    pub statuses_count: u64,
    #[serde(flatten)]
    pub raw: Map<String, Value>,
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub full_text: String,
    #[serde(flatten)]
    pub raw: Map<String, Value>,
}

/// Opaque pagination cursor produced by the API client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a timeline, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelinePage {
    pub posts: Vec<Post>,
    /// Cursor for the next (older) page, `None` when the timeline is exhausted.
    pub next: Option<PageCursor>,
}

/// Rate-limit window reported by the remote for one category.
///
/// `reset_in` is relative to the moment the response was received; the pool
/// turns it into an absolute instant when it records the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_in: Duration,
}

/// A successful remote call plus the rate-limit window it reported.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub body: T,
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl<T> Response<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, snapshot: RateLimitSnapshot) -> Self {
        self.rate_limit = Some(snapshot);
        self
    }
}
