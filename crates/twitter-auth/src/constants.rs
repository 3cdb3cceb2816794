//! Remote API endpoints
//!
//! Paths are relative to the configured base URL so tests can point the
//! client at a local mock server.

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com";

/// App-only bearer token endpoint (client credentials grant)
pub const TOKEN_PATH: &str = "/oauth2/token";

/// Single profile lookup (`users` rate-limit family)
pub const USERS_SHOW_PATH: &str = "/1.1/users/show.json";

/// Paginated timeline lookup (`statuses` rate-limit family)
pub const USER_TIMELINE_PATH: &str = "/1.1/statuses/user_timeline.json";

/// Per-credential rate-limit status
pub const RATE_LIMIT_STATUS_PATH: &str = "/1.1/application/rate_limit_status.json";

/// Rate-limit resource keys reported by `RATE_LIMIT_STATUS_PATH`
pub const USERS_SHOW_RESOURCE: &str = "/users/show/:id";
pub const USER_TIMELINE_RESOURCE: &str = "/statuses/user_timeline";

/// Largest page the timeline endpoint serves
pub const MAX_PAGE_SIZE: u32 = 200;
