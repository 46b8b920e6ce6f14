//! Password hashing, bearer tokens, login lockout and the auth middleware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::Argon2;
use argon2::password_hash::{
    Error as PasswordHashError, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
    rand_core::OsRng,
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, warn};

use crate::config::{LOCKOUT_DURATION, LOCKOUT_THRESHOLD};
use crate::error::ApiError;
use crate::state::AppState;

const TOKEN_LENGTH: usize = 48;

/// The authenticated caller, inserted into request extensions by
/// [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(expected_hash: &str, candidate: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(expected_hash)
        .map_err(|err| anyhow::anyhow!("stored password hash is invalid: {err}"))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(err) => Err(anyhow::anyhow!("failed to verify password: {err}")),
    }
}

fn generate_token(length: usize) -> String {
    let mut rng = rand::rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

#[derive(Debug)]
struct IssuedToken {
    user_id: String,
    expires_at: Instant,
}

/// Opaque bearer tokens with a fixed lifetime.
#[derive(Debug)]
pub struct TokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, user_id: &str) -> String {
        let token = generate_token(TOKEN_LENGTH);
        let now = Instant::now();
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, issued| issued.expires_at > now);
        tokens.insert(
            token.clone(),
            IssuedToken {
                user_id: user_id.to_string(),
                expires_at: now + self.ttl,
            },
        );
        token
    }

    /// Owner of a live token; expired tokens are forgotten on sight.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let mut tokens = self.tokens.lock();
        let issued = tokens.get(token)?;
        if issued.expires_at <= Instant::now() {
            tokens.remove(token);
            return None;
        }
        Some(issued.user_id.clone())
    }
}

#[derive(Debug)]
struct Attempts {
    failures: u32,
    last_failure: Instant,
    locked_until: Option<Instant>,
}

impl Attempts {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            last_failure: now,
            locked_until: None,
        }
    }

    /// A lock still running, or failures recent enough to count.
    fn is_live(&self, now: Instant, lockout: Duration) -> bool {
        match self.locked_until {
            Some(until) => until > now,
            None => now.saturating_duration_since(self.last_failure) < lockout,
        }
    }
}

/// Per-username failed-login counter. Failures older than the lockout
/// period stop counting.
#[derive(Debug)]
pub struct LoginGuard {
    threshold: u32,
    lockout: Duration,
    attempts: Mutex<HashMap<String, Attempts>>,
}

impl Default for LoginGuard {
    fn default() -> Self {
        Self::new(LOCKOUT_THRESHOLD, LOCKOUT_DURATION)
    }
}

impl LoginGuard {
    pub fn new(threshold: u32, lockout: Duration) -> Self {
        Self {
            threshold,
            lockout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining lock time, if `login` is locked right now.
    pub fn locked_for(&self, login: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        let locked_until = attempts.get(login)?.locked_until;
        match locked_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                attempts.remove(login);
                None
            }
            None => None,
        }
    }

    /// Counts a failure; returns the lock duration when this one trips it.
    pub fn record_failure(&self, login: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        if !attempts.contains_key(login) {
            attempts.retain(|_, entry| entry.is_live(now, self.lockout));
        }
        let entry = attempts
            .entry(login.to_string())
            .or_insert_with(|| Attempts::new(now));
        if !entry.is_live(now, self.lockout) {
            *entry = Attempts::new(now);
        }
        entry.failures += 1;
        entry.last_failure = now;
        if entry.failures >= self.threshold {
            entry.locked_until = Some(now + self.lockout);
            warn!(login, failures = entry.failures, "account locked");
            return Some(self.lockout);
        }
        None
    }

    pub fn record_success(&self, login: &str) {
        self.attempts.lock().remove(login);
    }

    #[cfg(test)]
    fn tracked_logins(&self) -> usize {
        self.attempts.lock().len()
    }
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("Please log in"))?;
    let token = header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

    let user_id = state
        .tokens
        .resolve(token)
        .ok_or_else(|| ApiError::unauthorized("Token invalid or expired, please log in again"))?;
    let user = state
        .repo
        .find_user(&user_id)
        .filter(|user| user.is_active)
        .ok_or_else(|| ApiError::unauthorized("User does not exist or is inactive"))?;

    debug!(user_id = %user.id, "request authenticated");
    req.extensions_mut().insert(AuthUser {
        id: user.id,
        username: user.username,
    });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LoginGuard, TokenStore, hash_password, verify_password};

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("Secret1").expect("hash");
        assert!(verify_password(&hash, "Secret1").expect("verify"));
        assert!(!verify_password(&hash, "secret1").expect("verify"));
    }

    #[test]
    fn expired_tokens_do_not_resolve() {
        let live = TokenStore::new(Duration::from_secs(60));
        let token = live.issue("u1");
        assert_eq!(live.resolve(&token).as_deref(), Some("u1"));
        assert!(live.resolve("forged").is_none());

        let expired = TokenStore::new(Duration::ZERO);
        let token = expired.issue("u1");
        assert!(expired.resolve(&token).is_none());
    }

    #[test]
    fn guard_locks_after_threshold_and_success_resets() {
        let guard = LoginGuard::new(3, Duration::from_secs(60));
        assert!(guard.record_failure("kim").is_none());
        assert!(guard.record_failure("kim").is_none());
        guard.record_success("kim");
        assert!(guard.record_failure("kim").is_none());
        assert!(guard.record_failure("kim").is_none());
        assert!(guard.record_failure("kim").is_some());
        assert!(guard.locked_for("kim").is_some());
        assert!(guard.locked_for("lee").is_none());
    }

    #[test]
    fn stale_failures_are_evicted() {
        let guard = LoginGuard::new(5, Duration::ZERO);
        for login in ["kim", "lee", "max"] {
            assert!(guard.record_failure(login).is_none());
        }
        assert_eq!(guard.tracked_logins(), 1);

        let guard = LoginGuard::new(5, Duration::from_secs(60));
        for login in ["kim", "lee", "max"] {
            assert!(guard.record_failure(login).is_none());
        }
        assert_eq!(guard.tracked_logins(), 3);
    }
}
