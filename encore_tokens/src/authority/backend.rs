//! A refresh authority backed by the application's own `/refresh` endpoint

use std::time::Duration;

use async_trait::async_trait;

use super::{dto, AuthorityError, RefreshAuthority, RefreshedToken};
use crate::{IdentityTokenRef, RefreshTokenRef};

/// Refreshes tokens through the application's backend
///
/// The backend holds the client secret for the resource API and performs the
/// upstream `refresh_token` grant on the caller's behalf. Requests are
/// authorized with the caller's identity token.
#[derive(Clone, Debug)]
pub struct BackendRefreshAuthority {
    client: reqwest::Client,
    refresh_url: reqwest::Url,
}

impl BackendRefreshAuthority {
    /// Constructs a new backend authority posting to `refresh_url`
    pub fn new(client: reqwest::Client, refresh_url: reqwest::Url) -> Self {
        Self {
            client,
            refresh_url,
        }
    }

    /// The endpoint refresh requests are sent to
    pub fn refresh_url(&self) -> &reqwest::Url {
        &self.refresh_url
    }
}

#[async_trait]
impl RefreshAuthority for BackendRefreshAuthority {
    async fn refresh(
        &self,
        identity_token: &IdentityTokenRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedToken, AuthorityError> {
        request_refresh(
            &self.client,
            self.refresh_url.clone(),
            identity_token,
            refresh_token,
        )
        .await
    }
}

#[tracing::instrument(
    err,
    skip(client, refresh_url, identity_token, refresh_token),
    fields(refresh_url = %refresh_url),
)]
async fn request_refresh(
    client: &reqwest::Client,
    refresh_url: reqwest::Url,
    identity_token: &IdentityTokenRef,
    refresh_token: &RefreshTokenRef,
) -> Result<RefreshedToken, AuthorityError> {
    tracing::trace!("requesting token refresh from backend");

    let resp = client
        .post(refresh_url)
        .bearer_auth(identity_token.as_str())
        .json(&dto::RefreshRequest { refresh_token })
        .send()
        .await
        .map_err(|e| AuthorityError::Unavailable(e.into()))?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received refresh response from backend"
    );

    if !status.is_success() {
        let body = resp
            .text()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.into()))?;
        return Err(AuthorityError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| AuthorityError::Unavailable(e.into()))?;
    let resp: dto::RefreshResponse =
        serde_json::from_slice(&body).map_err(|e| AuthorityError::MalformedResponse(e.into()))?;

    tracing::info!(
        has_refresh_token = resp.refresh_token.is_some(),
        expires_in = resp.expires_in,
        "received new access token"
    );

    Ok(RefreshedToken {
        access_token: resp.access_token,
        expires_in: resp.expires_in.map(Duration::from_secs),
        refresh_token: resp.refresh_token,
    })
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use tracing_test::traced_test;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{AccessToken, RefreshToken};

    async fn authority_for(server: &MockServer) -> Result<BackendRefreshAuthority> {
        let url = format!("{}/refresh", server.uri()).parse()?;
        Ok(BackendRefreshAuthority::new(reqwest::Client::new(), url))
    }

    #[tokio::test]
    #[traced_test]
    async fn sends_identity_and_refresh_token() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refresh"))
            .and(header("authorization", "Bearer i1"))
            .and(body_json(serde_json::json!({ "refresh_token": "r1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a2",
                "expires_in": 1800,
                "refresh_token": "r2",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let authority = authority_for(&server).await?;
        let token = authority
            .refresh(
                IdentityTokenRef::from_static("i1"),
                RefreshTokenRef::from_static("r1"),
            )
            .await?;

        assert_eq!(token.access_token, AccessToken::from_static("a2"));
        assert_eq!(token.expires_in, Some(Duration::from_secs(1800)));
        assert_eq!(token.refresh_token, Some(RefreshToken::from_static("r2")));
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_is_a_rejection_with_body() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&server)
            .await;

        let authority = authority_for(&server).await?;
        let err = authority
            .refresh(
                IdentityTokenRef::from_static("i1"),
                RefreshTokenRef::from_static("r1"),
            )
            .await
            .unwrap_err();

        match err {
            AuthorityError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(dto::is_invalid_grant(&body));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn success_without_access_token_is_malformed() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "expires_in": 3600 })),
            )
            .mount(&server)
            .await;

        let authority = authority_for(&server).await?;
        let err = authority
            .refresh(
                IdentityTokenRef::from_static("i1"),
                RefreshTokenRef::from_static("r1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorityError::MalformedResponse(_)));
        Ok(())
    }
}
