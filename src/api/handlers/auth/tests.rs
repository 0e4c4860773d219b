//! Auth router tests against in-memory stores.

use super::{
    AuthConfig, AuthState, CredentialStore, MemoryRateLimiter, MemorySessionStore, Role,
    SessionStore,
    authenticator::tests::FakeCredentialStore,
    login::{LoginOutcome, process_login},
};
use crate::api::app;
use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{
        HeaderMap, Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, LOCATION, PRAGMA, SET_COOKIE},
    },
    response::Response,
};
use secrecy::SecretString;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceExt;

const CLIENT: ([u8; 4], u16) = ([203, 0, 113, 7], 40_000);

fn auth_config() -> AuthConfig {
    AuthConfig::new()
        .with_max_login_attempts(3)
        .with_cookie_secure(false)
}

fn seeded_store() -> Result<FakeCredentialStore> {
    FakeCredentialStore::default()
        .with_user(Role::Registrar, 1, "registrar@x.edu", "regpw")?
        .with_user(Role::DepartmentAdmin, 2, "admin@x.edu", "adminpw")?
        .with_user(Role::Teacher, 3, "teacher@x.edu", "teacherpw")?
        .with_user(Role::Student, 4, "student1@x.edu", "correctpw")?
        .with_user(Role::Teacher, 5, "shared@x.edu", "teacherpw")?
        .with_user(Role::Student, 6, "shared@x.edu", "studentpw")
}

struct Harness {
    router: Router,
    store: Arc<FakeCredentialStore>,
}

impl Harness {
    fn new() -> Result<Self> {
        Ok(Self::with_store(Arc::new(seeded_store()?)))
    }

    fn with_store(store: Arc<FakeCredentialStore>) -> Self {
        Self::with_sessions(store, Arc::new(MemorySessionStore::new()))
    }

    fn with_sessions(store: Arc<FakeCredentialStore>, sessions: Arc<MemorySessionStore>) -> Self {
        Self::with_config(store, sessions, auth_config())
    }

    fn with_config(
        store: Arc<FakeCredentialStore>,
        sessions: Arc<MemorySessionStore>,
        config: AuthConfig,
    ) -> Self {
        let credentials: Arc<dyn CredentialStore> = store.clone();
        let session_store: Arc<dyn SessionStore> = sessions;
        let state = AuthState::new(
            config.clone(),
            credentials,
            Arc::new(MemoryRateLimiter::new(config.rate_limit_policy())),
            session_store,
        );
        Self {
            router: app(Arc::new(state)),
            store,
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<Response> {
        Ok(self.router.clone().oneshot(request).await?)
    }

    async fn login(&self, email: &str, password: &str, session: Option<&str>) -> Result<Response> {
        self.login_via(None, email, password, session).await
    }

    /// Login from the fixed peer address, optionally claiming a forwarded client.
    async fn login_via(
        &self,
        forwarded_for: Option<&str>,
        email: &str,
        password: &str,
        session: Option<&str>,
    ) -> Result<Response> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/auth/login")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .extension(ConnectInfo(SocketAddr::from(CLIENT)));
        if let Some(client) = forwarded_for {
            builder = builder.header("x-forwarded-for", client);
        }
        if let Some(token) = session {
            builder = builder.header(COOKIE, format!("smartspace_session={token}"));
        }
        let body = format!("email={email}&password={password}");
        self.send(builder.body(Body::from(body))?).await
    }

    async fn department(&self, session: Option<&str>) -> Result<Response> {
        let mut builder = Request::builder().uri("/users/api/department");
        if let Some(token) = session {
            builder = builder.header(COOKIE, format!("smartspace_session={token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }
}

fn location(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.strip_prefix(name)?.strip_prefix('='))
        .and_then(|rest| rest.split(';').next())
}

fn session_token(response: &Response) -> Result<String> {
    cookie(response.headers(), "smartspace_session")
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing session cookie"))
}

async fn body_text(response: Response) -> Result<String> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

async fn body_json(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    serde_json::from_slice(&bytes).context("response is not JSON")
}

#[tokio::test]
async fn each_role_lands_on_its_page() -> Result<()> {
    let harness = Harness::new()?;
    for (email, password, landing) in [
        ("registrar@x.edu", "regpw", "/registrar/registrar.php"),
        ("admin@x.edu", "adminpw", "/department-admin/dept-admin.php"),
        ("teacher@x.edu", "teacherpw", "/users/users_browse_room.php"),
        ("student1@x.edu", "correctpw", "/users/users_browse_room.php"),
    ] {
        let response = harness.login(email, password, None).await?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some(landing));
        assert!(cookie(response.headers(), "cache_invalidate").is_some());
        assert!(!session_token(&response)?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn student_login_stores_student_session() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.login("student1@x.edu", "correctpw", None).await?;
    let token = session_token(&response)?;

    let response = harness.department(Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["success"], true);
    assert_eq!(json["user_type"], "student");
    assert_eq!(json["user_id"], 4);
    assert_eq!(json["department"], "CCS");
    Ok(())
}

#[tokio::test]
async fn duplicate_email_resolves_by_password() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.login("shared@x.edu", "studentpw", None).await?;
    assert_eq!(location(&response), Some("/users/users_browse_room.php"));
    let token = session_token(&response)?;
    let json = body_json(harness.department(Some(&token)).await?).await?;
    assert_eq!(json["user_type"], "student");
    assert_eq!(json["user_id"], 6);

    let response = harness.login("shared@x.edu", "teacherpw", None).await?;
    let token = session_token(&response)?;
    let json = body_json(harness.department(Some(&token)).await?).await?;
    assert_eq!(json["user_type"], "teacher");
    assert_eq!(json["user_id"], 5);
    Ok(())
}

#[tokio::test]
async fn registrar_match_skips_remaining_tables() -> Result<()> {
    let harness = Harness::new()?;
    harness.login("registrar@x.edu", "regpw", None).await?;
    assert_eq!(harness.store.lookups(), vec![Role::Registrar]);
    Ok(())
}

#[tokio::test]
async fn invalid_login_reports_attempts_left() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.login("student1@x.edu", "wrongpw", None).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        Some("/index.php?error=invalid&attempts_left=2")
    );
    assert!(response.headers().get(SET_COOKIE).is_none());

    let response = harness.login("nobody@x.edu", "correctpw", None).await?;
    assert_eq!(
        location(&response),
        Some("/index.php?error=invalid&attempts_left=1")
    );
    Ok(())
}

#[tokio::test]
async fn locked_client_never_reaches_identity_tables() -> Result<()> {
    let harness = Harness::new()?;
    for _ in 0..3 {
        harness.login("student1@x.edu", "wrongpw", None).await?;
    }
    let lookups_before = harness.store.lookups().len();

    let response = harness.login("student1@x.edu", "correctpw", None).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/index.php?error=locked"));
    assert!(response.headers().get(SET_COOKIE).is_none());
    assert_eq!(harness.store.lookups().len(), lookups_before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_guesses_share_one_budget() -> Result<()> {
    let store = Arc::new(seeded_store()?);
    let config = AuthConfig::new().with_max_login_attempts(1);
    let credentials: Arc<dyn CredentialStore> = store.clone();
    let state = Arc::new(AuthState::new(
        config.clone(),
        credentials,
        Arc::new(MemoryRateLimiter::new(config.rate_limit_policy())),
        Arc::new(MemorySessionStore::new()),
    ));

    let mut handles = Vec::new();
    for guess in 0..10 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let password = SecretString::from(format!("guess{guess}"));
            process_login(&state, "203.0.113.7", None, "student1@x.edu", &password).await
        }));
    }

    let mut evaluated = 0;
    let mut locked = 0;
    for handle in handles {
        match handle.await?? {
            LoginOutcome::Invalid { attempts_left } => {
                assert_eq!(attempts_left, 0);
                evaluated += 1;
            }
            LoginOutcome::Locked => locked += 1,
            LoginOutcome::Authenticated { .. } => return Err(anyhow!("guess accepted")),
        }
    }
    assert_eq!(evaluated, 1);
    assert_eq!(locked, 9);
    assert_eq!(store.lookups().len(), Role::PRIORITY.len());
    Ok(())
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_budget() -> Result<()> {
    let harness = Harness::new()?;
    for (index, expected) in [(0, "2"), (1, "1"), (2, "0")] {
        let forwarded = format!("198.51.100.{index}");
        let response = harness
            .login_via(Some(&forwarded), "student1@x.edu", "wrongpw", None)
            .await?;
        assert_eq!(
            location(&response),
            Some(format!("/index.php?error=invalid&attempts_left={expected}").as_str())
        );
    }

    let response = harness
        .login_via(Some("198.51.100.99"), "student1@x.edu", "correctpw", None)
        .await?;
    assert_eq!(location(&response), Some("/index.php?error=locked"));
    Ok(())
}

#[tokio::test]
async fn trusted_proxy_headers_key_by_forwarded_client() -> Result<()> {
    let harness = Harness::with_config(
        Arc::new(seeded_store()?),
        Arc::new(MemorySessionStore::new()),
        auth_config().with_trust_proxy_headers(true),
    );
    for _ in 0..3 {
        harness
            .login_via(Some("198.51.100.1"), "student1@x.edu", "wrongpw", None)
            .await?;
    }
    let response = harness
        .login_via(Some("198.51.100.1"), "student1@x.edu", "correctpw", None)
        .await?;
    assert_eq!(location(&response), Some("/index.php?error=locked"));

    let response = harness
        .login_via(Some("198.51.100.2"), "student1@x.edu", "wrongpw", None)
        .await?;
    assert_eq!(
        location(&response),
        Some("/index.php?error=invalid&attempts_left=2")
    );
    Ok(())
}

#[tokio::test]
async fn success_clears_failed_attempts() -> Result<()> {
    let harness = Harness::new()?;
    harness.login("student1@x.edu", "wrongpw", None).await?;
    harness.login("student1@x.edu", "wrongpw", None).await?;
    harness.login("student1@x.edu", "correctpw", None).await?;

    let response = harness.login("student1@x.edu", "wrongpw", None).await?;
    assert_eq!(
        location(&response),
        Some("/index.php?error=invalid&attempts_left=2")
    );
    Ok(())
}

#[tokio::test]
async fn blank_credentials_are_rejected() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness.login("", "", None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await?, "Email and password are required.");

    let response = harness.login("%20%20", "secret", None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.store.lookups().is_empty());

    // Rejected input hands its reserved attempt back.
    let response = harness.login("student1@x.edu", "wrongpw", None).await?;
    assert_eq!(
        location(&response),
        Some("/index.php?error=invalid&attempts_left=2")
    );
    Ok(())
}

#[tokio::test]
async fn login_rotates_existing_session() -> Result<()> {
    let harness = Harness::new()?;
    let first = session_token(&harness.login("student1@x.edu", "correctpw", None).await?)?;
    let second = session_token(
        &harness
            .login("student1@x.edu", "correctpw", Some(&first))
            .await?,
    )?;
    assert_ne!(first, second);
    assert_eq!(
        harness.department(Some(&first)).await?.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        harness.department(Some(&second)).await?.status(),
        StatusCode::OK
    );
    Ok(())
}

#[tokio::test]
async fn store_failure_is_server_error() -> Result<()> {
    let harness = Harness::with_store(Arc::new(FakeCredentialStore::failing()));
    let response = harness.login("student1@x.edu", "correctpw", None).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

#[tokio::test]
async fn department_requires_student_or_teacher_session() -> Result<()> {
    let harness = Harness::new()?;
    assert_eq!(
        harness.department(None).await?.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        harness.department(Some("forged")).await?.status(),
        StatusCode::UNAUTHORIZED
    );

    let token = session_token(&harness.login("registrar@x.edu", "regpw", None).await?)?;
    assert_eq!(
        harness.department(Some(&token)).await?.status(),
        StatusCode::FORBIDDEN
    );
    Ok(())
}

#[tokio::test]
async fn department_store_failure_is_json_error() -> Result<()> {
    let sessions = Arc::new(MemorySessionStore::new());
    let healthy = Harness::with_sessions(Arc::new(seeded_store()?), sessions.clone());
    let token = session_token(&healthy.login("teacher@x.edu", "teacherpw", None).await?)?;

    let broken = Harness::with_sessions(Arc::new(FakeCredentialStore::failing()), sessions);
    let response = broken.department(Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await?;
    assert_eq!(json["success"], false);
    assert!(
        json["message"]
            .as_str()
            .is_some_and(|message| message.starts_with("Error retrieving user department: "))
    );
    Ok(())
}

#[tokio::test]
async fn logout_clears_session() -> Result<()> {
    let harness = Harness::new()?;
    let token = session_token(&harness.login("student1@x.edu", "correctpw", None).await?)?;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/logout")
        .header(COOKIE, format!("smartspace_session={token}"))
        .body(Body::empty())?;
    let response = harness.send(request).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/index.php"));
    assert_eq!(cookie(response.headers(), "smartspace_session"), Some(""));

    assert_eq!(
        harness.department(Some(&token)).await?.status(),
        StatusCode::UNAUTHORIZED
    );

    // Logging out twice is harmless.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/logout")
        .body(Body::empty())?;
    assert_eq!(harness.send(request).await?.status(), StatusCode::SEE_OTHER);
    Ok(())
}

#[tokio::test]
async fn connection_test_is_uncached_ok() -> Result<()> {
    let harness = Harness::new()?;
    let response = harness
        .send(Request::builder().uri("/connection-test").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(CACHE_CONTROL).map(|v| v.as_bytes()),
        Some(&b"no-store, no-cache, must-revalidate, max-age=0"[..])
    );
    assert_eq!(
        response.headers().get(PRAGMA).map(|v| v.as_bytes()),
        Some(&b"no-cache"[..])
    );
    assert!(response.headers().get("x-request-id").is_some());
    assert_eq!(body_text(response).await?, "OK");

    let response = harness
        .send(
            Request::builder()
                .method(Method::HEAD)
                .uri("/connection-test?nocache=1700000000000")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await?.is_empty());
    Ok(())
}
