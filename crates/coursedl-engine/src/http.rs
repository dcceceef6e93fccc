//! # Resilient HTTP
//!
//! Every request of the engine goes through [`ResilientClient`]:
//!
//! 1. wait on the shared [`RateGate`];
//! 2. send, retrying transport failures with a constant delay;
//! 3. on a throttle status, pause the whole gate, cool down, log in again
//!    and retry the request once;
//! 4. turn any other status >= 400 into [`FetchError::Status`].

use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthCoordinator, Credentials};
use crate::config::{EngineConfig, HttpConfig, ThrottleConfig, TransportRetryConfig};
use crate::error::{FetchError, Result};
use crate::gate::RateGate;
use crate::session::SessionStore;

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Config(format!("unsupported TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| FetchError::Config(format!("platform certificate verifier unavailable: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(8)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(FetchError::from)
}

/// Request body kept as bytes so it can be replayed on every attempt.
#[derive(Debug, Clone)]
enum Payload {
    Empty,
    Json(Bytes),
}

/// Whether a status >= 400 should become an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPolicy {
    Checked,
    Unchecked,
}

pub struct ResilientClient {
    client: Client,
    gate: Arc<RateGate>,
    auth: Arc<AuthCoordinator>,
    credentials: Option<Credentials>,
    transport_retry: TransportRetryConfig,
    throttle: ThrottleConfig,
    cancel: CancellationToken,
}

impl ResilientClient {
    pub fn new(
        client: Client,
        gate: Arc<RateGate>,
        auth: Arc<AuthCoordinator>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            gate,
            auth,
            credentials: None,
            transport_retry: config.transport_retry.clone(),
            throttle: config.throttle.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Credentials used to log in again after a throttle response.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Token aborting gate waits and in-flight requests of this client.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn auth(&self) -> &Arc<AuthCoordinator> {
        &self.auth
    }

    pub fn session(&self) -> &SessionStore {
        self.auth.session()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Logs in with the configured credentials, sharing any login in flight.
    pub async fn login(&self) -> Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| FetchError::Config("no credentials configured".to_string()))?;
        self.auth.login_once(credentials).await.map(|_| ())
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(Method::GET, url, Payload::Empty, StatusPolicy::Checked)
            .await
    }

    /// Like [`get`](Self::get) but hands back responses of any status.
    ///
    /// Throttle handling still applies.
    pub async fn get_unchecked(&self, url: &str) -> Result<Response> {
        self.execute(Method::GET, url, Payload::Empty, StatusPolicy::Unchecked)
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        let body = serde_json::to_vec(body)
            .map_err(|e| FetchError::Config(format!("unserializable request body: {e}")))?;
        self.execute(
            Method::POST,
            url,
            Payload::Json(Bytes::from(body)),
            StatusPolicy::Checked,
        )
        .await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        payload: Payload,
        policy: StatusPolicy,
    ) -> Result<Response> {
        let mut reauthenticated = false;
        loop {
            let response = self.send_with_retries(&method, url, &payload).await?;
            let status = response.status();

            if self.throttle.is_throttle(status) {
                if reauthenticated {
                    warn!(%url, %status, "Still throttled after re-authentication");
                    return Err(FetchError::Throttled {
                        status,
                        url: url.to_string(),
                    });
                }
                drop(response);
                self.cool_down_and_reauthenticate(status, url).await?;
                reauthenticated = true;
                continue;
            }

            if policy == StatusPolicy::Checked && status.as_u16() >= 400 {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Status {
                    status,
                    url: url.to_string(),
                    body,
                });
            }

            if status.is_success() {
                self.session().absorb(response.headers());
            }
            return Ok(response);
        }
    }

    /// Sends one logical request, retrying transport-level failures.
    async fn send_with_retries(
        &self,
        method: &Method,
        url: &str,
        payload: &Payload,
    ) -> Result<Response> {
        let max_attempts = self.transport_retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.gate.acquire(&self.cancel).await?;

            let request = self.build_request(method.clone(), url, payload);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                outcome = request.send() => outcome,
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) && attempt < max_attempts => {
                    warn!(%url, attempt, error = %e, "Request failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(self.transport_retry.delay) => {}
                    }
                }
                Err(e) => {
                    debug!(%url, attempt, error = %e, "Request failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn build_request(&self, method: Method, url: &str, payload: &Payload) -> RequestBuilder {
        let request = self.client.request(method, url);
        let request = match payload {
            Payload::Empty => request,
            Payload::Json(body) => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
        };
        self.session().apply(request)
    }

    /// Stops all traffic, waits out the throttle, and logs in again.
    async fn cool_down_and_reauthenticate(&self, status: StatusCode, url: &str) -> Result<()> {
        let _hold = self.gate.hold();
        warn!(
            %url,
            %status,
            cool_down = ?self.throttle.cool_down,
            "Throttled by the server, pausing all requests"
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.throttle.cool_down) => {}
        }

        match &self.credentials {
            Some(credentials) => {
                if let Err(e) = self.auth.login_once(credentials).await {
                    warn!(error = %e, "Re-authentication failed, retrying with the old session");
                }
            }
            None => info!("No credentials configured, retrying with the current session"),
        }
        Ok(())
    }
}

/// Connection problems and timeouts are worth another try; anything else
/// (bad URL, body decoding, redirect loops) is not.
fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::config::RateConfig;
    use crate::session::Session;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubAuthenticator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for StubAuthenticator {
        async fn login(&self, _credentials: &Credentials) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Session::from_cookie_header("GCID=fresh"))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig::builder()
            .with_rate(Duration::from_millis(1), 100)
            .with_transport_retry(3, Duration::from_millis(10))
            .with_throttle_timing(Duration::from_millis(20), Duration::ZERO)
            .build()
    }

    fn client_with(
        config: &EngineConfig,
        session: Session,
    ) -> (ResilientClient, Arc<StubAuthenticator>) {
        let authenticator = Arc::new(StubAuthenticator {
            calls: AtomicUsize::new(0),
        });
        let auth = Arc::new(AuthCoordinator::new(
            authenticator.clone(),
            SessionStore::new(session),
        ));
        let gate = Arc::new(RateGate::new(&RateConfig {
            period: config.rate.period,
            burst: config.rate.burst,
        }));
        let client = ResilientClient::new(
            create_client(&config.http).unwrap(),
            gate,
            auth,
            config,
        )
        .with_credentials(Credentials::new("user", "pass"));
        (client, authenticator)
    }

    #[tokio::test]
    async fn test_get_sends_session_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("cookie", "GCID=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config();
        let (client, _) = client_with(&config, Session::from_cookie_header("GCID=abc"));
        let body = client
            .get(&format!("{}/ok", server.uri()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_throttle_pauses_reauthenticates_and_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lesson"))
            .and(header("cookie", "GCID=stale"))
            .respond_with(ResponseTemplate::new(451))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/lesson"))
            .and(header("cookie", "GCID=fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config();
        let (client, authenticator) =
            client_with(&config, Session::from_cookie_header("GCID=stale"));
        let response = client
            .get(&format!("{}/lesson", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
        assert!(!client.gate().is_paused());
    }

    #[tokio::test]
    async fn test_repeated_throttle_surfaces_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(452))
            .expect(2)
            .mount(&server)
            .await;

        let config = test_config();
        let (client, authenticator) = client_with(&config, Session::new());
        let err = client.get(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Throttled { status, .. } if status.as_u16() == 452));
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.gate().pause_count(), 0);
    }

    #[tokio::test]
    async fn test_error_status_reports_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such lesson"))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config();
        let (client, authenticator) = client_with(&config, Session::new());
        let err = client.get(&server.uri()).await.unwrap_err();
        match err {
            FetchError::Status { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "no such lesson");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unchecked_get_returns_error_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let config = test_config();
        let (client, _) = client_with(&config, Session::new());
        let response = client.get_unchecked(&server.uri()).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_connection_errors_retry_then_fail() {
        // Reserve a port, then close it so connecting is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = test_config();
        let (client, _) = client_with(&config, Session::new());
        let started = std::time::Instant::now();
        let err = client.get(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
        // Two constant delays separate the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_paused_request() {
        let config = test_config();
        let (client, _) = client_with(&config, Session::new());
        let cancel = CancellationToken::new();
        let client = Arc::new(client.with_cancellation(cancel.clone()));

        client.gate().pause();
        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get("http://127.0.0.1:9/").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_post_json_and_rotated_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/serv/v1/article"))
            .and(header("content-type", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "GCID=rotated; Path=/")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;

        let config = test_config();
        let (client, _) = client_with(&config, Session::from_cookie_header("GCID=abc"));
        client
            .post_json(
                &format!("{}/serv/v1/article", server.uri()),
                &serde_json::json!({"id": "1"}),
            )
            .await
            .unwrap();
        assert_eq!(client.session().snapshot().cookie("GCID"), Some("rotated"));
    }

    #[tokio::test]
    async fn test_gzip_body_is_decompressed() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"#EXTM3U\nseg-1.ts\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_bytes(compressed),
            )
            .mount(&server)
            .await;

        let config = test_config();
        let (client, _) = client_with(&config, Session::new());
        let body = client.get(&server.uri()).await.unwrap().text().await.unwrap();
        assert_eq!(body, "#EXTM3U\nseg-1.ts\n");
    }
}
