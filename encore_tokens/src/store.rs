//! Persistence of token material
//!
//! Credentials are persisted in a [`KeyValueStore`], a handful of string
//! slots keyed by name. [`TokenStore`] maps the fields of a [`TokenState`]
//! onto those slots so that the backend can be swapped without touching the
//! refresh logic.

use std::{error, fmt, io};

use async_trait::async_trait;
use encore_clock::UnixTime;
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef, IdentityToken, RefreshToken, RefreshTokenRef, TokenState};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileStore;
pub use in_memory::InMemoryStore;

/// An error reading from or writing to a key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage could not be accessed
    #[error("unable to access token storage")]
    Io(#[from] io::Error),
    /// The backing storage held data that could not be decoded
    #[error("token storage is corrupt")]
    Corrupt(#[from] serde_json::Error),
    /// A slot held a value that is not valid for its field
    #[error("invalid value stored under '{key}'")]
    InvalidValue {
        /// The slot holding the value
        key: String,
        /// The reason the value was rejected
        source: Box<dyn error::Error + Send + Sync + 'static>,
    },
}

/// A string-keyed store of string values
///
/// Reads and writes are expected to complete promptly; the manager never
/// holds a lock across them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any existing value
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes any value stored under `key`
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// The slot names under which token material is stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    /// Slot for the resource API access token
    pub access_token: String,
    /// Slot for the refresh token
    pub refresh_token: String,
    /// Slot for the access token's expiry, in Unix milliseconds
    pub expires_at: String,
    /// Slot for this application's session credential
    pub identity_token: String,
    /// Slot for the "account is linked" flag
    pub connected: String,
}

impl StoreKeys {
    /// Slot names for a linked service, e.g. `spotify_access_token`
    ///
    /// The identity token is shared by every linked service and is always
    /// stored under `token`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            access_token: format!("{prefix}_access_token"),
            refresh_token: format!("{prefix}_refresh_token"),
            expires_at: format!("{prefix}_token_expiry"),
            identity_token: "token".to_owned(),
            connected: format!("{prefix}_connected"),
        }
    }
}

impl Default for StoreKeys {
    /// Slot names for the linked Spotify account
    fn default() -> Self {
        Self::with_prefix("spotify")
    }
}

/// Typed access to the [`TokenState`] held in a key-value store
pub struct TokenStore {
    backend: Box<dyn KeyValueStore>,
    keys: StoreKeys,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

const CONNECTED: &str = "true";

impl TokenStore {
    /// Constructs a token store over `backend` using the default slot names
    pub fn new(backend: impl KeyValueStore + 'static) -> Self {
        Self::with_keys(backend, StoreKeys::default())
    }

    /// Constructs a token store over `backend` using custom slot names
    pub fn with_keys(backend: impl KeyValueStore + 'static, keys: StoreKeys) -> Self {
        Self {
            backend: Box::new(backend),
            keys,
        }
    }

    /// The slot names used by this store
    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Reads all four token fields
    pub async fn load(&self) -> Result<TokenState, StoreError> {
        let access_token = self.backend.get(&self.keys.access_token).await?;
        let refresh_token = self.backend.get(&self.keys.refresh_token).await?;
        let expires_at = self.backend.get(&self.keys.expires_at).await?;
        let identity_token = self.backend.get(&self.keys.identity_token).await?;

        let expires_at = expires_at
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(UnixTime)
                    .map_err(|e| StoreError::InvalidValue {
                        key: self.keys.expires_at.clone(),
                        source: e.into(),
                    })
            })
            .transpose()?;

        Ok(TokenState {
            access_token: access_token.map(AccessToken::from),
            refresh_token: refresh_token.map(RefreshToken::from),
            expires_at,
            identity_token: identity_token.map(IdentityToken::from),
        })
    }

    /// Persists the result of a successful refresh
    ///
    /// The stored refresh token is only replaced when the authority rotated it.
    pub async fn store_refreshed(
        &self,
        access_token: &AccessTokenRef,
        expires_at: UnixTime,
        rotated_refresh_token: Option<&RefreshTokenRef>,
    ) -> Result<(), StoreError> {
        self.backend
            .set(&self.keys.access_token, access_token.as_str())
            .await?;
        self.backend
            .set(&self.keys.expires_at, &expires_at.as_millis().to_string())
            .await?;
        if let Some(refresh_token) = rotated_refresh_token {
            self.backend
                .set(&self.keys.refresh_token, refresh_token.as_str())
                .await?;
        }
        Ok(())
    }

    /// Clears the access token and its expiry, keeping the refresh material
    pub async fn clear_access(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.access_token).await?;
        self.backend.remove(&self.keys.expires_at).await
    }

    /// Clears all four token fields and marks the account as unlinked
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.clear_access().await?;
        self.backend.remove(&self.keys.refresh_token).await?;
        self.backend.remove(&self.keys.identity_token).await?;
        self.backend.remove(&self.keys.connected).await
    }

    /// Stores the credentials obtained when the account was linked
    ///
    /// Absent fields clear whatever was previously stored in their slot.
    pub async fn connect(&self, state: &TokenState) -> Result<(), StoreError> {
        self.put(
            &self.keys.access_token,
            state.access_token.as_ref().map(|t| t.as_str()),
        )
        .await?;
        self.put(
            &self.keys.refresh_token,
            state.refresh_token.as_ref().map(|t| t.as_str()),
        )
        .await?;
        self.put(
            &self.keys.expires_at,
            state
                .expires_at
                .map(|t| t.as_millis().to_string())
                .as_deref(),
        )
        .await?;
        self.put(
            &self.keys.identity_token,
            state.identity_token.as_ref().map(|t| t.as_str()),
        )
        .await?;
        self.backend.set(&self.keys.connected, CONNECTED).await
    }

    /// Whether the account is currently marked as linked
    pub async fn is_connected(&self) -> Result<bool, StoreError> {
        Ok(self.backend.get(&self.keys.connected).await?.as_deref() == Some(CONNECTED))
    }

    async fn put(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        match value {
            Some(value) => self.backend.set(key, value).await,
            None => self.backend.remove(key).await,
        }
    }
}
