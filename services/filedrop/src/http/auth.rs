//! Login sessions and the redirect-based access gate.
//!
//! A successful login issues a random token stored in the `auth` cookie and
//! remembered in [`SessionStore`]. Gated routes redirect to `/login` whenever
//! the cookie is missing, unknown, expired or revoked.

use super::{pages, AppState};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use cookie::time::{Duration as CookieDuration, OffsetDateTime};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Name of the session cookie
pub const AUTH_COOKIE: &str = "auth";

/// The single credential pair accepted by `/login`
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user: String,
    expires_at: DateTime<Utc>,
}

/// In-memory map of issued session tokens
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Lifetime given to new sessions
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new token for `user`
    pub fn create(&self, user: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1));

        self.sessions.write().insert(
            token.clone(),
            SessionEntry {
                user: user.to_string(),
                expires_at,
            },
        );
        token
    }

    /// User owning `token`, if the session exists and has not expired
    pub fn validate(&self, token: &str) -> Option<String> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read();
            match sessions.get(token) {
                None => return None,
                Some(entry) if entry.expires_at > now => return Some(entry.user.clone()),
                Some(_) => {}
            }
        }

        debug!("Dropping expired session");
        self.sessions.write().remove(token);
        None
    }

    /// Invalidate `token`; returns whether it was known
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Remove every expired session, returning how many were dropped
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    /// Number of live and not yet pruned sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Submitted login form; missing fields are treated as empty
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn session_cookie(token: String, ttl: Duration) -> Cookie<'static> {
    let lifetime = CookieDuration::seconds(ttl.as_secs() as i64);
    Cookie::build((AUTH_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(lifetime)
        .expires(OffsetDateTime::now_utc() + lifetime)
        .build()
}

/// `GET /login`
pub async fn login_page() -> Html<String> {
    pages::login_page()
}

/// `POST /login`
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    if !state.credentials.verify(&form.username, &form.password) {
        warn!(username = %form.username, "Rejected login attempt");
        return (StatusCode::FORBIDDEN, "Invalid username or password").into_response();
    }

    let pruned = state.sessions.prune_expired();
    if pruned > 0 {
        debug!(pruned, "Pruned expired sessions");
    }

    let token = state.sessions.create(&form.username);
    info!(username = %form.username, "User logged in");

    let jar = jar.add(session_cookie(token, state.sessions.ttl()));
    (jar, Redirect::to("/files")).into_response()
}

/// `GET /logout`
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(AUTH_COOKIE) {
        if state.sessions.revoke(cookie.value()) {
            info!("User logged out");
        }
    }

    let jar = jar.remove(Cookie::build(AUTH_COOKIE).path("/").build());
    (jar, Redirect::to("/login")).into_response()
}

/// Gate for protected routes: continue with a valid session, otherwise
/// redirect to the login page
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let user = jar
        .get(AUTH_COOKIE)
        .and_then(|cookie| state.sessions.validate(cookie.value()));

    match user {
        Some(user) => {
            debug!(user = %user, path = %request.uri().path(), "Session accepted");
            next.run(request).await
        }
        None => Redirect::to("/login").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use crate::storage::MemoryObjectStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(MemoryObjectStore::new()),
            Credentials::new("root", "root"),
            Duration::from_secs(3600),
        )
    }

    fn login_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn test_session_lifecycle() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create("root");

        assert_eq!(store.validate(&token).as_deref(), Some("root"));
        assert!(store.validate("unknown").is_none());
        assert!(store.revoke(&token));
        assert!(store.validate(&token).is_none());
        assert!(!store.revoke(&token));
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert_ne!(store.create("root"), store.create("root"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_expired_session_is_rejected_and_pruned() {
        let store = SessionStore::new(Duration::ZERO);
        let token = store.create("root");

        assert!(store.validate(&token).is_none());
        assert!(store.is_empty());

        store.create("root");
        assert_eq!(store.prune_expired(), 1);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("abc".to_string(), Duration::from_secs(86400));
        assert_eq!(cookie.name(), AUTH_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(CookieDuration::hours(24)));
    }

    #[tokio::test]
    async fn test_login_success_sets_cookie_and_redirects() {
        let state = test_state();
        let app = create_router(state.clone());

        let response = app
            .oneshot(login_request("username=root&password=root"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/files");

        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("auth="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert_eq!(state.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_login_failure_is_forbidden_without_cookie() {
        let app = create_router(test_state());

        let response = app
            .oneshot(login_request("username=root&password=wrong"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let app = create_router(test_state());

        let response = app.oneshot(login_request("username=root")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_gate_redirects_without_cookie() {
        let app = create_router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_gate_redirects_with_unknown_token() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/download?filename=a")
                    .header(header::COOKIE, "auth=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let state = test_state();
        let token = state.sessions.create("root");
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/logout")
                    .header(header::COOKIE, format!("auth={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("auth="));
        assert!(state.sessions.is_empty());

        // The old cookie no longer opens the gate
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/files")
                    .header(header::COOKIE, format!("auth={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }
}
