use std::time::Duration;

use encore_clock::UnixTime;

use crate::{
    AccessToken, AccessTokenRef, IdentityToken, IdentityTokenRef, RefreshToken, RefreshTokenRef,
};

/// The persisted credentials for one linked resource-API session
///
/// Every field may be absent. An access token is only usable when its expiry
/// is also known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenState {
    /// Bearer credential for the resource API
    pub access_token: Option<AccessToken>,
    /// Credential used to mint new access tokens
    pub refresh_token: Option<RefreshToken>,
    /// Absolute time after which the access token must be treated as invalid
    pub expires_at: Option<UnixTime>,
    /// This application's session credential, required to authorize a refresh
    pub identity_token: Option<IdentityToken>,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid for longer than the refresh margin
    Fresh,
    /// The token is still valid, but should be refreshed before use
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenState {
    /// Constructs a fully populated state, as stored when the account is linked
    pub fn new(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        expires_at: UnixTime,
        identity_token: IdentityToken,
    ) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            expires_at: Some(expires_at),
            identity_token: Some(identity_token),
        }
    }

    /// The access token together with its expiry, if both are known
    ///
    /// A token without a known expiry is never treated as usable.
    #[inline]
    pub fn usable_access_token(&self) -> Option<(&AccessTokenRef, UnixTime)> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) => Some((&**token, expires_at)),
            _ => None,
        }
    }

    /// Whether the state holds enough material to attempt a refresh
    #[inline]
    pub fn can_refresh(&self) -> bool {
        self.refresh_credentials().is_some()
    }

    /// The identity and refresh tokens needed to authorize a refresh
    #[inline]
    pub fn refresh_credentials(&self) -> Option<(&IdentityTokenRef, &RefreshTokenRef)> {
        match (&self.identity_token, &self.refresh_token) {
            (Some(identity), Some(refresh)) => Some((&**identity, &**refresh)),
            _ => None,
        }
    }

    /// Whether every field is absent
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.expires_at.is_none()
            && self.identity_token.is_none()
    }

    /// Gets the access token's lifetime status as of the provided time
    ///
    /// Returns `None` when there is no usable access token.
    pub fn token_status_at(&self, time: UnixTime, refresh_margin: Duration) -> Option<TokenStatus> {
        let (_, expires_at) = self.usable_access_token()?;
        let status = if time >= expires_at {
            TokenStatus::Expired
        } else if expires_at - time < refresh_margin {
            TokenStatus::Stale
        } else {
            TokenStatus::Fresh
        };
        Some(status)
    }

    /// Gets a duration for how much longer the access token would be valid as of
    /// the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Option<Duration> {
        self.expires_at.map(|expires_at| expires_at - time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARGIN: Duration = Duration::from_secs(60);

    fn linked(expires_at: UnixTime) -> TokenState {
        TokenState::new(
            AccessToken::from_static("a1"),
            RefreshToken::from_static("r1"),
            expires_at,
            IdentityToken::from_static("i1"),
        )
    }

    #[test]
    fn token_outside_margin_is_fresh() {
        let state = linked(UnixTime(70_000));
        assert_eq!(
            state.token_status_at(UnixTime(0), MARGIN),
            Some(TokenStatus::Fresh)
        );
    }

    #[test]
    fn token_inside_margin_is_stale() {
        let state = linked(UnixTime(30_000));
        assert_eq!(
            state.token_status_at(UnixTime(0), MARGIN),
            Some(TokenStatus::Stale)
        );
    }

    #[test]
    fn token_past_expiry_is_expired() {
        let state = linked(UnixTime(1_000));
        assert_eq!(
            state.token_status_at(UnixTime(2_000), MARGIN),
            Some(TokenStatus::Expired)
        );
        assert_eq!(state.until_expired_at(UnixTime(2_000)), Some(Duration::ZERO));
    }

    #[test]
    fn access_token_without_expiry_is_not_usable() {
        let state = TokenState {
            expires_at: None,
            ..linked(UnixTime(70_000))
        };
        assert!(state.usable_access_token().is_none());
        assert_eq!(state.token_status_at(UnixTime(0), MARGIN), None);
    }

    #[test]
    fn refresh_requires_identity_token() {
        let state = TokenState {
            identity_token: None,
            ..linked(UnixTime(70_000))
        };
        assert!(!state.can_refresh());
        assert!(state.refresh_credentials().is_none());
        assert!(TokenState::default().is_empty());
    }

    #[test]
    fn refresh_credentials_pair_identity_with_refresh_token() {
        let state = linked(UnixTime(70_000));
        let (identity, refresh) = state.refresh_credentials().expect("credentials");
        assert_eq!(identity.as_str(), "i1");
        assert_eq!(refresh.as_str(), "r1");
        assert!(state.can_refresh());
    }
}
