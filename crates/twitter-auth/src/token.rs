//! App-only bearer token exchange
//!
//! App identities trade their consumer key pair for a bearer token once at
//! startup (client credentials grant). The token does not expire; it is only
//! invalidated explicitly, which surfaces later as a rejected credential.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::TOKEN_PATH;
use crate::error::{Error, Result};
use crate::oauth1::percent_encode;

/// Bearer token for app-only requests.
#[derive(Debug, Clone)]
pub struct BearerToken(Secret<String>);

impl BearerToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    /// `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: Secret<String>,
}

/// Exchange an app key pair for a bearer token.
pub async fn request_app_token(
    client: &reqwest::Client,
    base_url: &str,
    consumer_key: &str,
    consumer_secret: &Secret<String>,
) -> Result<BearerToken> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH);
    let credentials = format!(
        "{}:{}",
        percent_encode(consumer_key),
        percent_encode(consumer_secret.expose())
    );

    let response = client
        .post(&url)
        .header(
            reqwest::header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode(credentials)),
        )
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    if !status.is_success() {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "app key pair rejected ({status}): {body}"
            )));
        }
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
    if !token.token_type.eq_ignore_ascii_case("bearer") {
        return Err(Error::TokenExchange(format!(
            "unexpected token type {:?}",
            token.token_type
        )));
    }
    debug!("app bearer token obtained");
    Ok(BearerToken(token.access_token))
}
