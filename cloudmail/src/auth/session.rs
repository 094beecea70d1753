//! Cookie sessions for the UI

use axum::http::{header, HeaderMap};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AuthUser;

pub const SESSION_COOKIE: &str = "cloudmail_session";

const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Session {
    user: AuthUser,
    expires_at: Instant,
}

/// In-memory map from opaque session ids to logged-in users
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Open a session for `user`, returning its id
    pub async fn create(&self, user: AuthUser) -> String {
        let id = Uuid::new_v4().to_string();
        let session = Session {
            user,
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    pub async fn get(&self, id: &str) -> Option<AuthUser> {
        let mut sessions = self.sessions.write().await;
        let expired = match sessions.get(id) {
            Some(session) if session.expires_at > Instant::now() => {
                return Some(session.user.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            sessions.remove(id);
        }
        None
    }

    pub async fn remove(&self, id: &str) -> Option<AuthUser> {
        self.sessions.write().await.remove(id).map(|s| s.user)
    }

    /// `Set-Cookie` value carrying `id`
    pub fn cookie(&self, id: &str) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE,
            id,
            self.ttl.as_secs()
        )
    }
}

/// `Set-Cookie` value that deletes the session cookie
pub fn clear_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Session id from the request's `Cookie` header
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    let prefix = format!("{}=", SESSION_COOKIE);

    cookies
        .split(';')
        .map(|cookie| cookie.trim())
        .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn user() -> AuthUser {
        AuthUser::admin("admin")
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let store = SessionStore::default();
        let id = store.create(user()).await;

        assert_eq!(store.get(&id).await, Some(user()));
        assert_eq!(store.remove(&id).await, Some(user()));
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session() {
        let store = SessionStore::new(Duration::from_millis(10));
        let id = store.create(user()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&id).await.is_none());
    }

    #[test]
    fn test_session_id_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; cloudmail_session=abc-123; other=1"),
        );
        assert_eq!(session_id(&headers).as_deref(), Some("abc-123"));

        headers.insert(header::COOKIE, HeaderValue::from_static("cloudmail_session="));
        assert!(session_id(&headers).is_none());
        assert!(session_id(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = SessionStore::default().cookie("abc");
        assert!(cookie.starts_with("cloudmail_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(clear_cookie().contains("Max-Age=0"));
    }
}
