//! Errors raised while obtaining or refreshing tokens

use std::{error, sync::Arc};

use thiserror::Error;

use crate::store::StoreError;

/// A refresh attempt failed
///
/// Every caller waiting on the same in-flight refresh receives a clone of the
/// same error, so underlying causes are shared behind an [`Arc`].
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// The refresh token or identity token is missing
    ///
    /// Refresh is impossible until the account is linked again.
    #[error("no refresh token or identity token available; the account must be reconnected")]
    NoRefreshToken,
    /// The authority rejected the refresh
    #[error("refresh rejected by authority with status {status}")]
    RefreshRejected {
        /// The HTTP status code returned by the authority
        status: u16,
        /// The response body, for diagnostics
        body: String,
        /// Whether the refresh token itself was rejected and the stored
        /// credentials were cleared
        terminal: bool,
    },
    /// The authority could not be reached, timed out, or failed internally
    ///
    /// The stored credentials are untouched; the next request for a token
    /// will try again.
    #[error("transient failure while refreshing the access token")]
    TransientRefreshFailure(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The authority accepted the refresh but returned an unusable response
    #[error("refresh authority returned an unusable response")]
    InvalidResponse(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The token storage could not be read or written
    #[error("unable to access token storage during refresh")]
    Store(#[source] Arc<StoreError>),
}

impl RefreshError {
    /// Whether the linked session is over and the user must re-authenticate
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoRefreshToken | Self::RefreshRejected { terminal: true, .. }
        )
    }

    /// Whether a later attempt may succeed without user interaction
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRefreshFailure(_))
    }

    pub(crate) fn abandoned() -> Self {
        Self::TransientRefreshFailure(Arc::new(RefreshAbandoned { _p: () }))
    }
}

impl From<StoreError> for RefreshError {
    fn from(err: StoreError) -> Self {
        Self::Store(Arc::new(err))
    }
}

/// The task performing an in-flight refresh was cancelled before it settled
#[derive(Clone, Copy, Debug, Error)]
#[error("in-flight refresh was abandoned before completing")]
pub struct RefreshAbandoned {
    _p: (),
}

/// No valid access token could be obtained
#[derive(Debug, Error)]
pub enum TokenError {
    /// No access token, expiry, or refresh token is stored
    #[error("no access token available; the account is not linked")]
    NoToken,
    /// The stored token needed refreshing and the refresh failed
    #[error("unable to refresh the access token")]
    Refresh(#[from] RefreshError),
    /// The token storage could not be read
    #[error("unable to read token storage")]
    Store(#[from] StoreError),
}

impl TokenError {
    /// Whether the user must link the account again before a token can be
    /// obtained
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::NoToken => true,
            Self::Refresh(err) => err.is_terminal(),
            Self::Store(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_rejection_requires_reconnect() {
        let err = TokenError::Refresh(RefreshError::RefreshRejected {
            status: 400,
            body: String::new(),
            terminal: true,
        });
        assert!(err.requires_reconnect());
    }

    #[test]
    fn non_terminal_rejection_does_not_require_reconnect() {
        let err = RefreshError::RefreshRejected {
            status: 403,
            body: String::new(),
            terminal: false,
        };
        assert!(!err.is_terminal());
        assert!(!err.is_transient());
    }

    #[test]
    fn abandoned_refresh_is_transient() {
        let err = RefreshError::abandoned();
        assert!(err.is_transient());
        assert!(!TokenError::from(err).requires_reconnect());
    }
}
