//! Middleware to attach the linked account's access token to outgoing requests

use std::fmt;

use bytes::{BufMut, BytesMut};
use encore_clock::{Clock, System};
use encore_tokens::{AccessTokenRef, TokenManager};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

/// A middleware that injects a valid access token into outgoing requests
///
/// The token is obtained through [`TokenManager::valid_token()`], so a token
/// close to expiry is refreshed before the request is sent. Failing to obtain
/// a token fails the request with a middleware error wrapping the
/// [`TokenError`](encore_tokens::TokenError).
///
/// This middleware does not retry requests rejected by the resource API; use
/// [`AuthenticatedClient`](crate::AuthenticatedClient) for that.
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P, C = System> {
    manager: TokenManager<C>,
    predicate: P,
}

impl<C> AccessTokenMiddleware<HttpsOnly, C> {
    /// Construct a new middleware from a token manager
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(manager: TokenManager<C>) -> Self {
        Self {
            manager,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P, C> {
        AccessTokenMiddleware {
            manager: self.manager,
            predicate,
        }
    }
}

fn bearer_header(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(reqwest_middleware::Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P, C> Middleware for AccessTokenMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let token = self
                .manager
                .valid_token()
                .await
                .map_err(reqwest_middleware::Error::middleware)?;

            tracing::trace!(%token, url = %req.url(), "attaching access token");

            req.headers_mut()
                .insert(header::AUTHORIZATION, bearer_header(&token)?);
        }

        next.run(req, extensions).await
    }
}

/// Reports a failed evaluation together with the request attribute inspected
fn mismatch<'a>(
    predicate: &'a dyn reflection::PredicateReflection,
    result: bool,
    expected: bool,
    attribute: &'static str,
    value: impl FnOnce() -> String,
) -> Option<reflection::Case<'a>> {
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(attribute, value()))
    })
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, self.eval(req), expected, "scheme", || {
            req.url().scheme().to_owned()
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token to requests for one host
///
/// Keeps the resource API's token away from other services sharing the same
/// client, such as the application's own backend.
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Matches requests whose URL host is exactly `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, self.eval(req), expected, "host", || {
            req.url().host_str().unwrap_or_default().to_owned()
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host is {}", self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::Result;
    use encore_tokens::{
        authority::BackendRefreshAuthority,
        store::{InMemoryStore, TokenStore},
        AccessToken, IdentityToken, ManagerConfig, RefreshToken, TokenError, TokenState,
    };
    use reqwest::{Client, Method, StatusCode};
    use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const LOCAL_HOST: &str = "127.0.0.1";

    fn linked(expires_in: Duration) -> TokenState {
        TokenState::new(
            AccessToken::from_static("a1"),
            RefreshToken::from_static("r1"),
            System.now() + expires_in,
            IdentityToken::from_static("i1"),
        )
    }

    async fn manager_for(server: &MockServer, state: TokenState) -> Result<TokenManager> {
        let authority = BackendRefreshAuthority::new(
            Client::new(),
            format!("{}/refresh", server.uri()).parse()?,
        );
        let manager = TokenManager::new(
            TokenStore::new(InMemoryStore::new()),
            authority,
            ManagerConfig::default(),
        );
        manager.connect(&state).await?;
        Ok(manager)
    }

    fn client_with<P>(middleware: AccessTokenMiddleware<P>) -> ClientWithMiddleware
    where
        P: Predicate<Request> + Send + Sync + 'static,
    {
        ClientBuilder::new(Client::new()).with(middleware).build()
    }

    async fn mount_player(server: &MockServer, authorization: &str) {
        Mock::given(method("GET"))
            .and(path("/v1/me/player"))
            .and(header("authorization", authorization))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
    }

    fn player_url(server: &MockServer) -> String {
        format!("{}/v1/me/player", server.uri())
    }

    mod when_request_targets_the_resource_api {
        use super::*;

        #[tokio::test]
        async fn fresh_token_is_attached() -> Result<()> {
            let server = MockServer::start().await;
            mount_player(&server, "Bearer a1").await;
            let manager = manager_for(&server, linked(Duration::from_secs(3600))).await?;

            let client = client_with(
                AccessTokenMiddleware::new(manager).with_predicate(ExactHostMatch::new(LOCAL_HOST)),
            );
            let resp = client.get(player_url(&server)).send().await?;

            assert_eq!(resp.status(), StatusCode::OK);
            Ok(())
        }

        #[tokio::test]
        async fn stale_token_is_refreshed_before_sending() -> Result<()> {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/refresh"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "a2",
                    "expires_in": 3600,
                })))
                .expect(1)
                .mount(&server)
                .await;
            mount_player(&server, "Bearer a2").await;
            let manager = manager_for(&server, linked(Duration::from_secs(30))).await?;

            let client = client_with(
                AccessTokenMiddleware::new(manager).with_predicate(ExactHostMatch::new(LOCAL_HOST)),
            );
            let resp = client.get(player_url(&server)).send().await?;

            assert_eq!(resp.status(), StatusCode::OK);
            Ok(())
        }

        #[tokio::test]
        async fn explicit_authorization_is_left_in_place() -> Result<()> {
            let server = MockServer::start().await;
            mount_player(&server, "Bearer override").await;
            let manager = manager_for(&server, linked(Duration::from_secs(30))).await?;

            let client = client_with(
                AccessTokenMiddleware::new(manager).with_predicate(ExactHostMatch::new(LOCAL_HOST)),
            );
            let resp = client
                .get(player_url(&server))
                .bearer_auth("override")
                .send()
                .await?;

            // The stale token would have needed a refresh, which has no mock.
            assert_eq!(resp.status(), StatusCode::OK);
            Ok(())
        }
    }

    mod when_request_does_not_match {
        use super::*;

        #[tokio::test]
        async fn plain_http_is_sent_without_a_token_by_default() -> Result<()> {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(|req: &wiremock::Request| !req.headers.contains_key("authorization"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            let manager = manager_for(&server, linked(Duration::from_secs(3600))).await?;

            let client = client_with(AccessTokenMiddleware::new(manager));
            let resp = client.get(player_url(&server)).send().await?;

            assert_eq!(resp.status(), StatusCode::OK);
            Ok(())
        }
    }

    mod when_account_is_not_linked {
        use super::*;

        #[tokio::test]
        async fn request_fails_before_reaching_the_network() -> Result<()> {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;
            let manager = manager_for(&server, TokenState::default()).await?;

            let client = client_with(
                AccessTokenMiddleware::new(manager).with_predicate(ExactHostMatch::new(LOCAL_HOST)),
            );
            let err = client.get(player_url(&server)).send().await.unwrap_err();

            match err {
                reqwest_middleware::Error::Middleware(err) => {
                    let err = err.downcast_ref::<TokenError>().expect("token error");
                    assert!(err.requires_reconnect());
                }
                other => panic!("unexpected error: {other:?}"),
            }
            Ok(())
        }
    }

    mod request_predicates {
        use super::*;

        fn get(url: &str) -> Request {
            Request::new(Method::GET, url.parse().unwrap())
        }

        #[test]
        fn composed_predicates_restrict_tokens_to_the_resource_api() {
            let predicate = HttpsOnly.and(ExactHostMatch::new("api.spotify.com"));

            assert!(predicate.eval(&get("https://api.spotify.com/v1/me")));
            assert!(!predicate.eval(&get("http://api.spotify.com/v1/me")));
            assert!(!predicate.eval(&get(
                "https://encore.example.com/api/spotify/refresh"
            )));
        }

        #[test]
        fn mismatch_names_the_inspected_host() {
            let predicate = ExactHostMatch::new("api.spotify.com");
            let request = get("https://encore.example.com/api/spotify/refresh");

            let case = predicate.find_case(true, &request).expect("mismatch");
            let product = case.products().next().expect("host product");
            assert_eq!(product.name(), "host");
            assert_eq!(product.value().to_string(), "encore.example.com");
            assert!(predicate.find_case(false, &request).is_none());
            assert_eq!(predicate.to_string(), "host is api.spotify.com");
        }

        #[test]
        fn mismatch_names_the_inspected_scheme() {
            let case = HttpsOnly
                .find_case(true, &get("http://api.spotify.com/v1/me"))
                .expect("mismatch");
            let product = case.products().next().expect("scheme product");
            assert_eq!(product.value().to_string(), "http");
        }
    }
}
