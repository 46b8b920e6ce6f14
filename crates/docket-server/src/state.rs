use crate::auth::{LoginGuard, TokenStore};
use crate::config::ServerConfig;
use crate::convert::DocumentConverter;
use crate::storage::Repository;

/// Shared by every handler behind an `Arc`.
#[derive(Debug)]
pub struct AppState {
    pub config: ServerConfig,
    pub repo: Repository,
    pub tokens: TokenStore,
    pub login_guard: LoginGuard,
    pub converter: DocumentConverter,
}

impl AppState {
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let repo = Repository::open(&config.data_dir)?;
        Ok(Self {
            tokens: TokenStore::new(config.token_ttl),
            login_guard: LoginGuard::default(),
            converter: DocumentConverter::new(config.pdf_converter.clone()),
            repo,
            config,
        })
    }
}
