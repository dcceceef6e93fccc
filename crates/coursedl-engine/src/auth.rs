//! # Authentication
//!
//! [`AuthCoordinator`] collapses concurrent login requests into one network
//! call. When many requests hit the same throttle at once, each of them asks
//! for a fresh login; the first caller performs it and everybody else awaits
//! the same shared result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::session::{Session, SessionStore};

/// Account credentials used for password login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Performs the actual network login.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session>;
}

/// Error envelope returned by the account service.
#[derive(Debug, Default, Deserialize)]
struct AccountEnvelope {
    #[serde(default)]
    error: Option<AccountError>,
}

#[derive(Debug, Deserialize)]
struct AccountError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Logs in by posting the credentials as JSON to the account endpoint.
///
/// Uses the raw client on purpose: re-authentication happens while the rate
/// gate is paused, so going through the gate would never complete.
pub struct PasswordAuthenticator {
    client: Client,
    login_url: String,
}

impl PasswordAuthenticator {
    pub fn new(client: Client, login_url: impl Into<String>) -> Self {
        Self {
            client,
            login_url: login_url.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let body = json!({
            "country": 86,
            "cellphone": credentials.account,
            "password": credentials.password,
            "captcha": "",
            "remember": 1,
            "platform": 3,
            "appid": 1,
            "source": "",
        });

        let response = self.client.post(&self.login_url).json(&body).send().await?;
        let status = response.status();
        let session = Session::from_set_cookie_headers(response.headers());
        let bytes = response.bytes().await?;

        if status.as_u16() >= 400 {
            return Err(FetchError::Login(format!(
                "account service returned {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        // Non-JSON bodies carry no error envelope; the cookies decide.
        let envelope: AccountEnvelope = serde_json::from_slice(&bytes).unwrap_or_default();
        if let Some(error) = envelope.error.filter(|e| e.code < 0) {
            return Err(FetchError::Login(format!("{} ({})", error.msg, error.code)));
        }

        debug!(cookies = ?session.cookie_header().map(|c| c.len()), "Login response received");
        Ok(session)
    }
}

type SharedLogin = Shared<BoxFuture<'static, Result<Session>>>;

/// Deduplicates concurrent logins and publishes the resulting session.
pub struct AuthCoordinator {
    authenticator: Arc<dyn Authenticator>,
    session: SessionStore,
    settle: Duration,
    in_flight: Mutex<Option<SharedLogin>>,
}

impl AuthCoordinator {
    pub fn new(authenticator: Arc<dyn Authenticator>, session: SessionStore) -> Self {
        Self {
            authenticator,
            session,
            settle: Duration::ZERO,
            in_flight: Mutex::new(None),
        }
    }

    /// Delay the login leader waits after success before releasing everyone.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Logs in, or joins the login already in flight.
    ///
    /// Every concurrent caller receives the same outcome. The in-flight slot
    /// is cleared once the login finishes, so a later failure can start a new
    /// attempt.
    pub async fn login_once(&self, credentials: &Credentials) -> Result<Session> {
        let (login, leader) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                // A finished future left behind by a dropped leader is stale.
                Some(pending) if pending.peek().is_none() => (pending.clone(), false),
                _ => {
                    let login = self.start_login(credentials.clone());
                    *slot = Some(login.clone());
                    (login, true)
                }
            }
        };

        if !leader {
            info!("Login request shared with the one in flight");
        }

        let result = login.clone().await;

        if leader {
            let mut slot = self.in_flight.lock();
            // A late leader must not evict a newer login started meanwhile.
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&login)) {
                slot.take();
            }
        }
        result
    }

    fn start_login(&self, credentials: Credentials) -> SharedLogin {
        let authenticator = Arc::clone(&self.authenticator);
        let session = self.session.clone();
        let settle = self.settle;

        async move {
            info!(account = %credentials.account, "Logging in");
            let fresh = match authenticator.login(&credentials).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!(error = %e, "Login failed");
                    return Err(e);
                }
            };
            session.replace(fresh.clone());
            info!("Login succeeded, session replaced");

            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            Ok(fresh)
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingAuthenticator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingAuthenticator {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn login(&self, _credentials: &Credentials) -> Result<Session> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(FetchError::Login(format!("rejected #{call}")));
            }
            Ok(Session::from_cookie_header(&format!("GCID=session-{call}")))
        }
    }

    fn creds() -> Credentials {
        Credentials::new("13800000000", "secret")
    }

    fn test_client() -> Client {
        crate::http::create_client(&crate::config::HttpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_logins_are_deduplicated() {
        let authenticator = CountingAuthenticator::new(false);
        let coordinator = Arc::new(AuthCoordinator::new(
            authenticator.clone(),
            SessionStore::default(),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.login_once(&creds()).await })
            })
            .collect();

        for handle in handles {
            let session = handle.await.unwrap().unwrap();
            assert_eq!(session.cookie("GCID"), Some("session-1"));
        }
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.session().snapshot().cookie("GCID"),
            Some("session-1")
        );
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_clears_slot() {
        let authenticator = CountingAuthenticator::new(true);
        let coordinator = Arc::new(AuthCoordinator::new(
            authenticator.clone(),
            SessionStore::default(),
        ));

        let credentials = creds();
        let (a, b) = tokio::join!(
            coordinator.login_once(&credentials),
            coordinator.login_once(&credentials)
        );
        assert_eq!(a.unwrap_err().to_string(), "Login failed: rejected #1");
        assert_eq!(b.unwrap_err().to_string(), "Login failed: rejected #1");
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);

        // Nothing in flight any more: the next call issues a new login.
        let c = coordinator.login_once(&creds()).await;
        assert!(c.is_err());
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);
    }

    /// Logs in only when released, recording how many logins overlap.
    struct GatedAuthenticator {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        release: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl Authenticator for GatedAuthenticator {
        async fn login(&self, _credentials: &Credentials) -> Result<Session> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            self.release
                .acquire()
                .await
                .expect("semaphore stays open")
                .forget();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Session::from_cookie_header(&format!("GCID=session-{call}")))
        }
    }

    #[tokio::test]
    async fn test_late_leader_keeps_newer_login_in_slot() {
        use std::future::Future;
        use std::task::Context;

        let authenticator = Arc::new(GatedAuthenticator {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            release: tokio::sync::Semaphore::new(0),
        });
        let coordinator = AuthCoordinator::new(authenticator.clone(), SessionStore::default());
        let credentials = creds();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        // The leader starts login #1 and is then not scheduled for a while.
        let mut leader = Box::pin(coordinator.login_once(&credentials));
        assert!(leader.as_mut().poll(&mut cx).is_pending());

        // A follower drives login #1 to completion on its own.
        let follower = coordinator.login_once(&credentials);
        authenticator.release.add_permits(1);
        let first = follower.await.unwrap();
        assert_eq!(first.cookie("GCID"), Some("session-1"));

        // The slot now holds a finished login, so this caller starts #2.
        let mut second = Box::pin(coordinator.login_once(&credentials));
        assert!(second.as_mut().poll(&mut cx).is_pending());
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);

        // The late leader finishes and must leave login #2 in place.
        leader.await.unwrap();

        let mut joiner = Box::pin(coordinator.login_once(&credentials));
        assert!(joiner.as_mut().poll(&mut cx).is_pending());
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);

        authenticator.release.add_permits(1);
        let (second, joined) = tokio::join!(second, joiner);
        assert_eq!(second.unwrap().cookie("GCID"), Some("session-2"));
        assert_eq!(joined.unwrap().cookie("GCID"), Some("session-2"));
        assert_eq!(authenticator.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_credentials_debug_hides_password() {
        let printed = format!("{:?}", creds());
        assert!(printed.contains("13800000000"));
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn test_password_authenticator_collects_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/account/ticket/login"))
            .and(body_partial_json(json!({"cellphone": "13800000000"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "GCID=abc; Path=/")
                    .append_header("set-cookie", "GCESS=def; HttpOnly")
                    .set_body_json(json!({"code": 0, "data": {}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let authenticator = PasswordAuthenticator::new(
            test_client(),
            format!("{}/account/ticket/login", server.uri()),
        );
        let session = authenticator.login(&creds()).await.unwrap();
        assert_eq!(session.cookie("GCID"), Some("abc"));
        assert_eq!(session.cookie("GCESS"), Some("def"));
    }

    #[tokio::test]
    async fn test_password_authenticator_rejects_error_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"error": {"code": -3031, "msg": "wrong password"}}),
            ))
            .mount(&server)
            .await;

        let authenticator = PasswordAuthenticator::new(test_client(), server.uri());
        let err = authenticator.login(&creds()).await.unwrap_err();
        assert!(matches!(err, FetchError::Login(ref msg) if msg.contains("wrong password")));
    }
}
