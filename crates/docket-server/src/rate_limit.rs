//! Fixed-window request limits keyed by client address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    clients: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window: Duration) -> Self {
        Self {
            name,
            limit,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request from `key`; `Err` carries the time until the
    /// window resets.
    pub fn check(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut clients = self.clients.lock();
        if !clients.contains_key(key) {
            let span = self.window;
            clients.retain(|_, window| now.saturating_duration_since(window.started) < span);
        }
        let entry = clients.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.limit {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            return Err(retry_after);
        }
        entry.count += 1;
        Ok(())
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = client_key(&req);
    if let Err(retry_after) = limiter.check(&key, Instant::now()) {
        warn!(
            limiter = limiter.name,
            client = %key,
            retry_after_secs = retry_after.as_secs(),
            "rate limit exceeded"
        );
        return Err(ApiError::too_many_requests(retry_after));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::RateLimiter;

    #[test]
    fn window_blocks_after_limit_then_resets() {
        let limiter = RateLimiter::new("test", 2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.check("10.0.0.1", start).is_ok());
        assert!(limiter.check("10.0.0.1", start).is_ok());
        let retry = limiter
            .check("10.0.0.1", start + Duration::from_secs(10))
            .expect_err("limited");
        assert_eq!(retry, Duration::from_secs(50));

        assert!(limiter.check("10.0.0.2", start).is_ok());
        assert!(
            limiter
                .check("10.0.0.1", start + Duration::from_secs(61))
                .is_ok()
        );
    }

    #[test]
    fn finished_windows_are_evicted_when_a_new_client_arrives() {
        let limiter = RateLimiter::new("test", 5, Duration::from_secs(60));
        let start = Instant::now();
        for n in 0..10 {
            assert!(limiter.check(&format!("10.0.1.{n}"), start).is_ok());
        }
        assert_eq!(limiter.tracked_clients(), 10);

        assert!(
            limiter
                .check("10.0.2.1", start + Duration::from_secs(30))
                .is_ok()
        );
        assert_eq!(limiter.tracked_clients(), 11);

        assert!(
            limiter
                .check("10.0.2.2", start + Duration::from_secs(61))
                .is_ok()
        );
        assert_eq!(limiter.tracked_clients(), 2);
    }
}
