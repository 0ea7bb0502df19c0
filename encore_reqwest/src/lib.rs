//! Authenticated resource API requests backed by a [`TokenManager`](encore_tokens::TokenManager)
//!
//! [`AuthenticatedClient`] sends requests with the linked account's access
//! token and recovers from a token the resource API rejects: on a
//! `401 Unauthorized` the stored token is invalidated, refreshed, and the
//! request is retried once.
//!
//! ```
//! use encore_reqwest::AuthenticatedClient;
//! use encore_tokens::TokenManager;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct CurrentlyPlaying {
//!     is_playing: bool,
//! }
//!
//! # async fn run(manager: TokenManager) -> Result<(), Box<dyn std::error::Error>> {
//! let client = AuthenticatedClient::new(reqwest::Client::new(), manager);
//!
//! let playing: Option<CurrentlyPlaying> = client
//!     .fetch_with_token("https://api.spotify.com/v1/me/player/currently-playing".parse()?)
//!     .await?;
//!
//! if playing.map_or(false, |p| p.is_playing) {
//!     tracing::info!("something is playing");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack instead to
//! attach a valid access token to each outbound request. The middleware does
//! not retry rejected requests.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. These predicates can be composed together to
//! evaluate more complex requirements prior to attaching a token to a
//! request.
//!
//! ```
//! use encore_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use encore_tokens::TokenManager;
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # fn build(manager: TokenManager) {
//! AccessTokenMiddleware::new(manager)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.spotify.com")));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
mod middleware;

pub use client::{AuthenticatedClient, RequestError};
pub use middleware::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
