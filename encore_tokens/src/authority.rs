//! Authorities that mint new access tokens

use std::{error, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{AccessToken, IdentityTokenRef, RefreshToken, RefreshTokenRef};

#[cfg(feature = "backend")]
pub mod backend;
pub mod dto;

#[cfg(feature = "backend")]
pub use backend::BackendRefreshAuthority;

/// Tokens issued by a successful refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshedToken {
    /// The new access token
    pub access_token: AccessToken,
    /// How long the access token is valid, if the authority said so
    pub expires_in: Option<Duration>,
    /// A replacement refresh token, if the authority rotated it
    pub refresh_token: Option<RefreshToken>,
}

/// An error reported by a refresh authority
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority answered with a non-success status
    #[error("authority rejected the refresh with status {status}")]
    Rejected {
        /// The HTTP status code of the response
        status: u16,
        /// The body of the response, for diagnostics
        body: String,
    },
    /// The authority answered with a success status but an unusable body
    #[error("authority returned a malformed token response")]
    MalformedResponse(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The authority could not be reached or the response could not be read
    #[error("unable to reach the refresh authority")]
    Unavailable(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// A source of fresh access tokens
///
/// Implementations perform exactly one exchange per call; deduplication of
/// concurrent refreshes is handled by the [`TokenManager`](crate::TokenManager).
#[async_trait]
pub trait RefreshAuthority: Send + Sync {
    /// Exchanges `refresh_token` for a new access token, authorized by
    /// `identity_token`
    async fn refresh(
        &self,
        identity_token: &IdentityTokenRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedToken, AuthorityError>;
}
