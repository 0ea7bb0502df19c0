//! Resource API requests that recover from a rejected access token

use std::error;

use encore_clock::{Clock, System};
use encore_tokens::{AccessToken, TokenError, TokenManager};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// A request to the resource API failed
#[derive(Debug, Error)]
pub enum RequestError {
    /// No valid access token could be obtained, either before the request or
    /// while recovering from a rejected token
    #[error("no valid access token available")]
    NoValidToken(#[source] TokenError),
    /// The resource API answered with a non-success status
    #[error("resource API request failed with status {status}")]
    RequestFailed {
        /// The status returned by the resource API
        status: StatusCode,
        /// The response body, for diagnostics
        body: String,
    },
    /// The request could not be sent
    #[error("unable to send request to resource API")]
    Send(#[source] reqwest::Error),
    /// The response body could not be read
    #[error("unable to read resource API response body")]
    Body(#[source] reqwest::Error),
    /// The response body was not the expected JSON
    #[error("unable to deserialize resource API response")]
    Deserialize(#[from] serde_json::Error),
}

impl RequestError {
    /// The status returned by the resource API, if it answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the user must link the account again before requests can succeed
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::NoValidToken(err) => err.requires_reconnect(),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    Second,
}

impl Attempt {
    /// The attempt that follows a rejected token, if another is allowed
    fn retry(self) -> Option<Self> {
        match self {
            Self::First => Some(Self::Second),
            Self::Second => None,
        }
    }
}

/// A client for the resource API that keeps its access token valid
///
/// Each request is sent with a token from the [`TokenManager`]. If the
/// resource API answers `401 Unauthorized`, the stored access token is
/// invalidated, refreshed, and the request is retried exactly once. No other
/// status is retried.
#[derive(Clone, Debug)]
pub struct AuthenticatedClient<C = System> {
    client: reqwest::Client,
    manager: TokenManager<C>,
}

impl<C> AuthenticatedClient<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new client sending requests through `client`
    pub fn new(client: reqwest::Client, manager: TokenManager<C>) -> Self {
        Self { client, manager }
    }

    /// The token manager supplying access tokens
    pub fn manager(&self) -> &TokenManager<C> {
        &self.manager
    }

    /// Sends a `GET` request to `url` and deserializes the JSON response
    ///
    /// An empty response body, such as that of a `204 No Content`, is
    /// deserialized as JSON `null`, so `Option<T>` yields `None`.
    #[tracing::instrument(skip(self, url), fields(url = %url))]
    pub async fn fetch_with_token<T>(&self, url: Url) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        let mut token = self
            .manager
            .valid_token()
            .await
            .map_err(RequestError::NoValidToken)?;
        let mut attempt = Attempt::First;

        loop {
            let resp = self.send(url.clone(), &token).await?;
            let status = resp.status();
            tracing::debug!(
                response.status = status.as_u16(),
                ?attempt,
                "received resource API response"
            );

            if status.is_success() {
                let body = resp.bytes().await.map_err(RequestError::Body)?;
                return parse_body(&body);
            }

            if status == StatusCode::UNAUTHORIZED {
                if let Some(next) = attempt.retry() {
                    tracing::warn!("resource API rejected access token, refreshing");
                    token = self
                        .manager
                        .invalidate_and_refresh()
                        .await
                        .map_err(|err| RequestError::NoValidToken(err.into()))?;
                    attempt = next;
                    continue;
                }
            }

            let body = match resp.text().await {
                Ok(body) => body,
                Err(error) => {
                    tracing::debug!(
                        error = (&error as &dyn error::Error),
                        "unable to read error response body"
                    );
                    String::new()
                }
            };
            return Err(RequestError::RequestFailed { status, body });
        }
    }

    /// Sends a `GET` request to `url` and returns the untyped JSON response
    pub async fn fetch_json(&self, url: Url) -> Result<serde_json::Value, RequestError> {
        self.fetch_with_token(url).await
    }

    async fn send(&self, url: Url, token: &AccessToken) -> Result<reqwest::Response, RequestError> {
        self.client
            .get(url)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(RequestError::Send)
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RequestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(serde_json::from_slice(b"null")?)
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}
