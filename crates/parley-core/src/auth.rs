use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const USERS_FILE: &str = "users.json";
pub const SESSION_COOKIE: &str = "parley_session";
const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Same error for an unknown user and a wrong password.
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Username is already taken")]
    UserExists,
    #[error("{0}")]
    Validation(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("user store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("user store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Argon2id PHC string; the salt is embedded.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

pub struct UserStore {
    base: PathBuf,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, AuthError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let users_file = base.join(USERS_FILE);
        let users = if users_file.exists() {
            let raw = fs::read_to_string(&users_file).await?;
            serde_json::from_str::<HashMap<String, UserRecord>>(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            users: RwLock::new(users),
        })
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn exists(&self, username: &str) -> bool {
        let key = username.trim().to_ascii_lowercase();
        self.users.read().await.contains_key(&key)
    }

    /// Creates a user and returns the canonical (lower-cased) username.
    pub async fn register(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let username = normalize_username(username)?;
        validate_password(password)?;
        if self.users.read().await.contains_key(&username) {
            return Err(AuthError::UserExists);
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|err| AuthError::Hash(format!("hash task join error: {err}")))??;

        let mut users = self.users.write().await;
        if users.contains_key(&username) {
            return Err(AuthError::UserExists);
        }
        let mut next = users.clone();
        next.insert(
            username.clone(),
            UserRecord {
                username: username.clone(),
                password_hash,
                created_at: Utc::now(),
            },
        );
        // The account only exists once users.json holds it.
        self.persist(&next).await?;
        *users = next;
        Ok(username)
    }

    /// Returns the canonical username when the password matches.
    pub async fn verify(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let key = username.trim().to_ascii_lowercase();
        let Some(record) = self.users.read().await.get(&key).cloned() else {
            return Err(AuthError::InvalidCredentials);
        };
        let password = password.to_string();
        let stored = record.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|err| AuthError::Hash(format!("verify task join error: {err}")))?;
        if matches {
            Ok(record.username)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    async fn persist(&self, users: &HashMap<String, UserRecord>) -> Result<(), AuthError> {
        let payload = serde_json::to_string_pretty(users)?;
        let staging = self.base.join(format!("{USERS_FILE}.tmp"));
        fs::write(&staging, payload).await?;
        if let Err(err) = fs::rename(&staging, self.base.join(USERS_FILE)).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }
}

pub fn normalize_username(raw: &str) -> Result<String, AuthError> {
    let username = raw.trim().to_ascii_lowercase();
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(AuthError::Validation(format!(
            "Username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters"
        )));
    }
    let allowed = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !allowed {
        return Err(AuthError::Validation(
            "Username may only contain letters, digits, '_', '.' and '-'".to_string(),
        ));
    }
    Ok(username)
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        tracing::warn!("stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub username: String,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
}

/// In-memory login sessions. A session expires once it has been idle for
/// longer than the TTL; restarting the server logs everyone out.
pub struct SessionRegistry {
    ttl_ms: u64,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_ms: ttl_secs.saturating_mul(1000),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_ms / 1000
    }

    pub async fn issue(&self, username: &str) -> String {
        let token = new_session_token();
        let now = now_ms();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| !is_expired(s, now, self.ttl_ms));
        sessions.insert(
            token.clone(),
            SessionRecord {
                username: username.to_string(),
                created_at_ms: now,
                last_seen_ms: now,
            },
        );
        token
    }

    pub async fn validate(&self, token: &str) -> Option<String> {
        let now = now_ms();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token)?;
        if is_expired(session, now, self.ttl_ms) {
            sessions.remove(token);
            return None;
        }
        session.last_seen_ms = now;
        Some(session.username.clone())
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    pub async fn active_count(&self) -> usize {
        let now = now_ms();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !is_expired(s, now, self.ttl_ms))
            .count()
    }
}

fn is_expired(session: &SessionRecord, now: u64, ttl_ms: u64) -> bool {
    now.saturating_sub(session.last_seen_ms) >= ttl_ms
}

fn new_session_token() -> String {
    format!("ps_{}", Uuid::new_v4().simple())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn session_cookie(token: &str, ttl_secs: u64, secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={ttl_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0")
}

/// Pulls a cookie value out of a `Cookie` header.
pub fn extract_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Session token from the `parley_session` cookie, falling back to an
/// `Authorization: Bearer` header for scripted clients.
pub fn extract_session_token(
    cookie_header: Option<&str>,
    authorization: Option<&str>,
) -> Option<String> {
    if let Some(token) = cookie_header
        .and_then(|raw| extract_cookie(raw, SESSION_COOKIE))
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    let trimmed = authorization?.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
