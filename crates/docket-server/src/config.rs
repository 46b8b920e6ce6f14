use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::debug;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const LOCKOUT_THRESHOLD: u32 = 5;
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub token_ttl: Duration,
    pub auth_rate_limit: u32,
    pub api_rate_limit: u32,
    pub pdf_converter: String,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    /// Defaults with everything stored under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 3000,
            data_dir: data_dir.into(),
            token_ttl: Duration::from_secs(24 * 60 * 60),
            auth_rate_limit: 20,
            api_rate_limit: 100,
            pdf_converter: "pdftotext".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }

    #[tracing::instrument]
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for unset
    /// keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = Self::with_data_dir(
            lookup("DOCKET_DATA_DIR").unwrap_or_else(|| "./data".to_string()),
        );

        if let Some(raw) = lookup("DOCKET_BIND") {
            cfg.bind = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid DOCKET_BIND address: {raw}"))?;
        }
        if let Some(raw) = lookup("PORT") {
            cfg.port = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT: {raw}"))?;
        }
        if let Some(raw) = lookup("DOCKET_TOKEN_TTL_HOURS") {
            let hours: u64 = parse_positive("DOCKET_TOKEN_TTL_HOURS", &raw)?;
            cfg.token_ttl = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(raw) = lookup("DOCKET_AUTH_RATE_LIMIT") {
            cfg.auth_rate_limit = parse_positive("DOCKET_AUTH_RATE_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("DOCKET_API_RATE_LIMIT") {
            cfg.api_rate_limit = parse_positive("DOCKET_API_RATE_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("DOCKET_PDF_CONVERTER")
            && !raw.trim().is_empty()
        {
            cfg.pdf_converter = raw.trim().to_string();
        }
        if let Some(raw) = lookup("DOCKET_CORS_ORIGINS") {
            cfg.cors_origins = raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }

        debug!(?cfg, "server configuration resolved");
        Ok(cfg)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn parse_positive<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a positive integer, got {raw:?}"))?;
    if value <= T::default() {
        return Err(anyhow!("{key} must be a positive integer, got {raw:?}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::ServerConfig;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.auth_rate_limit, 20);
        assert_eq!(cfg.api_rate_limit, 100);
        assert_eq!(cfg.token_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.pdf_converter, "pdftotext");
    }

    #[test]
    fn environment_overrides_are_validated() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("DOCKET_TOKEN_TTL_HOURS", "2"),
            ("DOCKET_CORS_ORIGINS", "https://a.example, https://b.example"),
        ]))
        .expect("config");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.token_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.cors_origins.len(), 2);

        assert!(ServerConfig::from_lookup(lookup(&[("DOCKET_API_RATE_LIMIT", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "http")])).is_err());
    }
}
