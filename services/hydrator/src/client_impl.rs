//! REST client: `TimelineApi` over `reqwest`.
//!
//! One `TwitterClient` per authenticated identity. App identities send their
//! bearer token; user identities sign every request with OAuth 1.0a. Each
//! response's `x-rate-limit-*` headers become the snapshot the pool records.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use remote::{
    ApiError, BoxFuture, EndpointCategory, EntityId, ErrorClassification, PageCursor, Post,
    Profile, RateLimitSnapshot, Response, TimelineApi, TimelinePage,
};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use twitter_auth::{
    BearerToken, ClientAuth, OAuthSigner, RATE_LIMIT_STATUS_PATH, USER_TIMELINE_PATH,
    USER_TIMELINE_RESOURCE, USERS_SHOW_PATH, USERS_SHOW_RESOURCE, percent_encode,
    request_app_token,
};

const LIMIT_HEADER: &str = "x-rate-limit-limit";
const REMAINING_HEADER: &str = "x-rate-limit-remaining";
const RESET_HEADER: &str = "x-rate-limit-reset";

/// How a client authenticates its requests.
#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(BearerToken),
    OAuth1(OAuthSigner),
}

/// Authenticated client for one identity.
pub struct TwitterClient {
    id: String,
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    page_size: u32,
}

impl TwitterClient {
    pub fn new(id: String, http: reqwest::Client, base_url: &str, auth: Auth, page_size: u32) -> Self {
        Self {
            id,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            page_size,
        }
    }

    /// Build a client for `identity`. App identities exchange their key
    /// pair for a bearer token first.
    pub async fn connect(
        identity: &ClientAuth,
        http: &reqwest::Client,
        base_url: &str,
        page_size: u32,
    ) -> twitter_auth::Result<Self> {
        let auth = match identity {
            ClientAuth::App {
                consumer_key,
                consumer_secret,
                ..
            } => Auth::Bearer(request_app_token(http, base_url, consumer_key, consumer_secret).await?),
            ClientAuth::User {
                consumer_key,
                consumer_secret,
                access_key,
                access_secret,
                ..
            } => Auth::OAuth1(OAuthSigner::new(
                consumer_key.clone(),
                consumer_secret.clone(),
                access_key.clone(),
                access_secret.clone(),
            )),
        };
        Ok(Self::new(
            identity.label().to_string(),
            http.clone(),
            base_url,
            auth,
            page_size,
        ))
    }

    /// Authenticated GET returning the decoded body and its rate-limit window.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> remote::Result<Response<T>> {
        let url = format!("{}{}", self.base_url, path);
        let authorization = match &self.auth {
            Auth::Bearer(token) => token.header_value(),
            Auth::OAuth1(signer) => signer
                .sign("GET", &url, &params)
                .map_err(|e| ApiError::Auth(e.to_string()))?,
        };
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let full_url = if query.is_empty() {
            url
        } else {
            format!("{url}?{query}")
        };

        debug!(client = %self.id, path, "GET");
        let response = self
            .http
            .get(&full_url)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let rate_limit = parse_rate_limit(response.headers(), now_epoch());
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Http(format!("reading response body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(parse_error(status, &body, rate_limit));
        }

        let decoded: T =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Response {
            body: decoded,
            rate_limit,
        })
    }
}

/// `user_id` for numeric identifiers, `screen_name` otherwise.
fn entity_param(entity: &EntityId) -> (String, String) {
    match entity.as_numeric() {
        Some(id) => ("user_id".into(), id.to_string()),
        None => ("screen_name".into(), entity.to_string()),
    }
}

impl TimelineApi for TwitterClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_profile<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, remote::Result<Response<Profile>>> {
        Box::pin(async move { self.get(USERS_SHOW_PATH, vec![entity_param(entity)]).await })
    }

    fn timeline_page<'a>(
        &'a self,
        entity: &'a EntityId,
        cursor: Option<&'a PageCursor>,
    ) -> BoxFuture<'a, remote::Result<Response<TimelinePage>>> {
        Box::pin(async move {
            let mut params = vec![
                entity_param(entity),
                ("count".into(), self.page_size.to_string()),
                ("tweet_mode".into(), "extended".into()),
                ("include_rts".into(), "true".into()),
            ];
            if let Some(cursor) = cursor {
                params.push(("max_id".into(), cursor.0.clone()));
            }

            let response: Response<Vec<Post>> = self.get(USER_TIMELINE_PATH, params).await?;
            // Older page = strictly below the oldest id seen
            let next = response
                .body
                .iter()
                .map(|post| post.id)
                .min()
                .filter(|&oldest| oldest > 0)
                .map(|oldest| PageCursor((oldest - 1).to_string()));
            Ok(Response {
                body: TimelinePage {
                    posts: response.body,
                    next,
                },
                rate_limit: response.rate_limit,
            })
        })
    }

    fn rate_limit_status(&self) -> BoxFuture<'_, remote::Result<Vec<(EndpointCategory, RateLimitSnapshot)>>> {
        Box::pin(async move {
            let response: Response<serde_json::Value> = self
                .get(
                    RATE_LIMIT_STATUS_PATH,
                    vec![("resources".into(), "users,statuses".into())],
                )
                .await?;
            Ok(parse_status(&response.body, now_epoch()))
        })
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Read the `x-rate-limit-*` headers. `None` unless `remaining` is present.
fn parse_rate_limit(headers: &HeaderMap, now: u64) -> Option<RateLimitSnapshot> {
    let number = |name: &str| -> Option<u64> { headers.get(name)?.to_str().ok()?.trim().parse().ok() };
    let remaining = number(REMAINING_HEADER)?;
    let reset_in = number(RESET_HEADER)
        .map(|reset| Duration::from_secs(reset.saturating_sub(now)))
        .unwrap_or_default();
    Some(RateLimitSnapshot {
        limit: number(LIMIT_HEADER).map(clamp_u32),
        remaining: clamp_u32(remaining),
        reset_in,
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: Option<u32>,
    message: String,
}

/// Turn a non-2xx response into a typed error.
///
/// Accepts both payload shapes the API uses: `{"errors":[{code,message}]}`
/// and `{"error":"..."}`.
fn parse_error(status: u16, body: &str, rate_limit: Option<RateLimitSnapshot>) -> ApiError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let (code, message) = match parsed {
        Some(ErrorBody { errors, error }) => match errors.into_iter().next() {
            Some(entry) => (entry.code, entry.message),
            None => (None, error.unwrap_or_else(|| format!("HTTP {status}"))),
        },
        None => (None, format!("HTTP {status}")),
    };

    if twitter_pool::classify_status(status, code) == ErrorClassification::RateLimited {
        return ApiError::RateLimited {
            reset_in: rate_limit.map(|snapshot| snapshot.reset_in),
        };
    }
    ApiError::Remote {
        status,
        code,
        message,
    }
}

/// Extract the profile and timeline windows from a rate-limit status body.
fn parse_status(body: &serde_json::Value, now: u64) -> Vec<(EndpointCategory, RateLimitSnapshot)> {
    [
        (EndpointCategory::ProfileLookup, "users", USERS_SHOW_RESOURCE),
        (EndpointCategory::TimelineLookup, "statuses", USER_TIMELINE_RESOURCE),
    ]
    .into_iter()
    .filter_map(|(category, family, resource)| {
        let window = body.get("resources")?.get(family)?.get(resource)?;
        let remaining = window.get("remaining")?.as_u64()?;
        let reset = window.get("reset").and_then(|v| v.as_u64()).unwrap_or(now);
        Some((
            category,
            RateLimitSnapshot {
                limit: window.get("limit").and_then(|v| v.as_u64()).map(clamp_u32),
                remaining: clamp_u32(remaining),
                reset_in: Duration::from_secs(reset.saturating_sub(now)),
            },
        ))
    })
    .collect()
}
