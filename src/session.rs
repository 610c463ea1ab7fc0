use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::request::cookie_value;

pub const SESSION_COOKIE: &str = "drive";
pub const TOKEN_LEN: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub username: String,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory login sessions keyed by token. Expired entries are swept lazily
/// on every lookup.
pub struct SessionStore {
    by_token: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_token: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.by_token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, username: &str, now: Instant) -> Session {
        let session = Session {
            token: generate_token(TOKEN_LEN),
            username: username.to_string(),
            expires_at: now + self.ttl,
        };
        self.insert(session.clone());
        session
    }

    pub fn insert(&self, session: Session) {
        self.sessions().insert(session.token.clone(), session);
    }

    /// Resolve the session named by the `drive` cookie in a raw `Cookie`
    /// header.
    pub fn get(&self, cookie_header: Option<&str>, now: Instant) -> Option<Session> {
        let token = cookie_header.and_then(|raw| cookie_value(raw, SESSION_COOKIE));
        let mut sessions = self.sessions();
        sessions.retain(|_, session| session.is_live(now));
        sessions.get(token?).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }
}

pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn set_cookie_header(session: &Session, ttl: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        session.token,
        ttl.as_secs()
    )
}
