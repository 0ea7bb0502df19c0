//! Lifecycle management for the access token of a linked music-service account
//!
//! When a user links their Spotify account, the application receives an access
//! token, a refresh token, and an expiry. This crate keeps those credentials
//! usable: it hands out the stored access token while it is comfortably valid,
//! refreshes it through the application's backend shortly before it expires,
//! and makes sure that concurrent callers never trigger more than one refresh
//! at a time.
//!
//! # General Flow
//!
//! Credentials are persisted through a [`TokenStore`](store::TokenStore) over any
//! [`KeyValueStore`](store::KeyValueStore). New access tokens are minted by a
//! [`RefreshAuthority`](authority::RefreshAuthority), normally the application's
//! own `/refresh` endpoint. A [`TokenManager`] ties the two together and is
//! handed to every call site that needs a token.
//!
//! ```
//! use encore_tokens::{
//!     authority::BackendRefreshAuthority,
//!     store::{FileStore, TokenStore},
//!     ManagerConfig, TokenManager,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = TokenStore::new(FileStore::new(".encore/tokens.json"));
//! let authority = BackendRefreshAuthority::new(
//!     reqwest::Client::new(),
//!     "https://encore.example.com/api/spotify/refresh".parse()?,
//! );
//!
//! let manager = TokenManager::new(store, authority, ManagerConfig::default());
//!
//! match manager.get_valid_token().await {
//!     Some(token) => tracing::info!(%token, "obtained access token"),
//!     None => tracing::warn!("spotify account must be reconnected"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Refresh Semantics
//!
//! * A token with more than [`ManagerConfig::refresh_margin()`] of validity left is
//!   returned without any network call.
//! * Otherwise a refresh is started, or joined if one is already in flight. Each
//!   refresh request is bounded by [`ManagerConfig::refresh_timeout()`].
//! * When the authority rejects the refresh token itself (HTTP 400/401 or
//!   `invalid_grant`), all stored credentials are cleared and the account is
//!   marked as unlinked.
//! * Network errors, timeouts, and server errors leave the credentials in place;
//!   the next request for a token tries again.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `backend`: Provides [`BackendRefreshAuthority`](authority::BackendRefreshAuthority),
//!   which refreshes tokens over HTTP using [reqwest].
//! * `file`: Provides [`FileStore`](store::FileStore), a key-value store persisted to
//!   the local filesystem.
//!
//! The `rustls-tls` feature is not enabled by default. It enables HTTPS support in
//! [reqwest] through `rustls`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
mod braids;
mod error;
mod manager;
mod state;
pub mod store;

pub use braids::*;
pub use error::{RefreshAbandoned, RefreshError, TokenError};
pub use manager::{ManagerConfig, TokenManager};
pub use state::{TokenState, TokenStatus};
