//! Credential descriptors
//!
//! One `AccountCredentials` entry in the config describes an app key pair
//! and the user access tokens authorized under it. Each of those is an
//! independent identity with its own rate limits, so the pool gets one
//! client per identity: the app itself (app-only auth) plus one per user
//! token (user-context auth).

use common::Secret;
use serde::Deserialize;

/// One configured app and the user tokens authorized under it.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountCredentials {
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    #[serde(default)]
    pub user_auth: Vec<UserToken>,
}

/// A user access token pair.
#[derive(Debug, Clone, Deserialize)]
pub struct UserToken {
    pub access_key: String,
    pub access_secret: Secret<String>,
}

impl AccountCredentials {
    /// Reject entries with blank keys before any client is built.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.consumer_key.trim().is_empty() {
            return Err("consumer_key must not be empty".into());
        }
        if self.consumer_secret.is_blank() {
            return Err(format!(
                "consumer_secret for {} must not be empty",
                key_prefix(&self.consumer_key)
            ));
        }
        for (i, user) in self.user_auth.iter().enumerate() {
            if user.access_key.trim().is_empty() || user.access_secret.is_blank() {
                return Err(format!(
                    "user_auth[{i}] for {} needs both access_key and access_secret",
                    key_prefix(&self.consumer_key)
                ));
            }
        }
        Ok(())
    }
}

/// One authenticated identity, ready to become a pool client.
#[derive(Debug, Clone)]
pub enum ClientAuth {
    /// App-only auth: the key pair is exchanged for a bearer token.
    App {
        label: String,
        consumer_key: String,
        consumer_secret: Secret<String>,
    },
    /// User-context auth: every request is OAuth 1.0a signed.
    User {
        label: String,
        consumer_key: String,
        consumer_secret: Secret<String>,
        access_key: String,
        access_secret: Secret<String>,
    },
}

impl ClientAuth {
    /// Non-secret identifier for logs (`app-0:abc123`, `user-0.1:abc123`).
    pub fn label(&self) -> &str {
        match self {
            ClientAuth::App { label, .. } | ClientAuth::User { label, .. } => label,
        }
    }
}

/// Expand configured accounts into one identity per app and per user token.
///
/// Order is stable: each app identity is followed by its user identities.
pub fn expand_accounts(accounts: &[AccountCredentials]) -> Vec<ClientAuth> {
    let mut identities = Vec::new();
    for (n, account) in accounts.iter().enumerate() {
        let prefix = key_prefix(&account.consumer_key);
        identities.push(ClientAuth::App {
            label: format!("app-{n}:{prefix}"),
            consumer_key: account.consumer_key.clone(),
            consumer_secret: account.consumer_secret.clone(),
        });
        for (i, user) in account.user_auth.iter().enumerate() {
            identities.push(ClientAuth::User {
                label: format!("user-{n}.{i}:{prefix}"),
                consumer_key: account.consumer_key.clone(),
                consumer_secret: account.consumer_secret.clone(),
                access_key: user.access_key.clone(),
                access_secret: user.access_secret.clone(),
            });
        }
    }
    identities
}

/// First characters of a consumer key; enough to tell apps apart in logs.
fn key_prefix(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(6)
        .map(|(i, _)| i)
        .unwrap_or(key.len());
    &key[..end]
}
