//! Credential handling for the timeline API
//!
//! Provides the credential descriptors read from the config file, app-only
//! bearer token exchange, and OAuth 1.0a request signing for user-context
//! clients. This crate has no dependency on the pool or the binary.
//!
//! Client flow:
//! 1. Config deserializes `AccountCredentials` (one app key pair plus any
//!    number of user access token pairs)
//! 2. `expand_accounts()` yields one `ClientAuth` per identity
//! 3. App identities exchange their key pair for a bearer token via
//!    `token::request_app_token()`
//! 4. User identities sign every request with `oauth1::OAuthSigner`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod oauth1;
pub mod token;

pub use constants::*;
pub use credentials::{AccountCredentials, ClientAuth, UserToken, expand_accounts};
pub use error::{Error, Result};
pub use oauth1::{OAuthSigner, percent_encode};
pub use token::{BearerToken, request_app_token};
