// src/session.rs
use crate::error::{AppError, Result};
use crate::models::UserId;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session";

const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Identity of the caller, resolved once per request and passed explicitly to
/// every portfolio operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub user_id: UserId,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

struct SessionRecord {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

/// Server-side session table. The token handed to the client only names a
/// session; whether it is live is decided here.
pub struct SessionStore {
    secret: Vec<u8>,
    ttl: Duration,
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl SessionStore {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        SessionStore {
            secret: secret.as_bytes().to_vec(),
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Starts a session for `user_id` and returns its cookie token.
    pub async fn create(&self, user_id: UserId) -> Result<String> {
        let id = Uuid::new_v4();
        let expires_at = Utc::now() + self.ttl;
        let claims = Claims {
            sub: id.to_string(),
            exp: usize::try_from(expires_at.timestamp()).unwrap_or(0),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| {
            error!("Failed to sign session token: {}", e);
            AppError::Internal("could not start session".to_string())
        })?;

        self.sessions.write().await.insert(
            id,
            SessionRecord {
                user_id,
                expires_at,
            },
        );
        debug!("Session {} opened for user {}", id, user_id);
        Ok(token)
    }

    fn session_id(&self, token: &str) -> Option<Uuid> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Validation::default(),
        )
        .ok()?;
        Uuid::parse_str(&data.claims.sub).ok()
    }

    pub async fn resolve(&self, token: &str) -> Option<Context> {
        let id = self.session_id(token)?;
        let sessions = self.sessions.read().await;
        let record = sessions.get(&id)?;
        if record.expires_at <= Utc::now() {
            return None;
        }
        Some(Context {
            user_id: record.user_id,
        })
    }

    /// Ends the session named by `token`. Unknown or invalid tokens are ignored.
    pub async fn destroy(&self, token: &str) {
        if let Some(id) = self.session_id(token) {
            if self.sessions.write().await.remove(&id).is_some() {
                debug!("Session {} closed", id);
            }
        }
    }

    pub async fn active(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_resolves_until_destroyed() {
        let store = SessionStore::new("secret", 3600);
        let token = store.create(7).await.unwrap();
        assert_eq!(store.resolve(&token).await, Some(Context { user_id: 7 }));

        store.destroy(&token).await;
        assert_eq!(store.resolve(&token).await, None);
        // logout twice is harmless
        store.destroy(&token).await;
    }

    #[tokio::test]
    async fn foreign_or_tampered_tokens_are_rejected() {
        let store = SessionStore::new("secret", 3600);
        let other = SessionStore::new("another-secret", 3600);
        let token = other.create(1).await.unwrap();
        assert_eq!(store.resolve(&token).await, None);
        assert_eq!(store.resolve("not-a-token").await, None);

        let mut forged = store.create(1).await.unwrap();
        forged.push('x');
        assert_eq!(store.resolve(&forged).await, None);
    }

    #[tokio::test]
    async fn sessions_do_not_survive_a_new_store() {
        let token = SessionStore::new("secret", 3600).create(3).await.unwrap();
        let restarted = SessionStore::new("secret", 3600);
        assert_eq!(restarted.resolve(&token).await, None);
    }

    #[tokio::test]
    async fn expired_sessions_are_ignored_and_purged() {
        let store = SessionStore::new("secret", 0);
        let token = store.create(9).await.unwrap();
        assert_eq!(store.resolve(&token).await, None);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
    }
}
