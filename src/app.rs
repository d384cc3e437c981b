//! App Core for Smartmark.
//!
//! Wires the row store, the identity provider, the session manager and the
//! bookmark synchronizer together and manages their lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::managers::bookmark_sync::{BookmarkSynchronizer, BookmarkSynchronizerTrait, SessionBinding};
use crate::managers::session_manager::{SessionManager, SessionManagerTrait};
use crate::remote::{AuthBackend, LocalAuth, RowStore, SqliteStore};
use crate::types::settings::ClientSettings;

/// One client process: at most one live session and its bookmark list.
pub struct App {
    pub settings: ClientSettings,
    pub store: Arc<SqliteStore>,
    pub auth: Arc<LocalAuth>,
    pub sessions: SessionManager,
    pub bookmarks: BookmarkSynchronizer,
    binding: Option<SessionBinding>,
}

impl App {
    /// Opens the store named in `settings` and starts a client on it.
    pub async fn new(settings: ClientSettings) -> anyhow::Result<Self> {
        let store = match &settings.database_path {
            Some(path) => SqliteStore::open(path)
                .with_context(|| format!("opening row store at {}", path))?,
            None => SqliteStore::open_in_memory().context("opening in-memory row store")?,
        };
        Self::with_backends(settings, Arc::new(store), Arc::new(LocalAuth::new())).await
    }

    /// Starts a client on existing backends; several clients may share them.
    pub async fn with_backends(
        settings: ClientSettings,
        store: Arc<SqliteStore>,
        auth: Arc<LocalAuth>,
    ) -> anyhow::Result<Self> {
        settings.validate().context("invalid settings")?;

        let sessions = SessionManager::start(auth.clone() as Arc<dyn AuthBackend>, &settings)
            .await
            .context("starting session manager")?;
        let bookmarks =
            BookmarkSynchronizer::new(store.clone() as Arc<dyn RowStore>, &settings.channel_prefix);
        let binding = Some(bookmarks.follow_sessions(&sessions));

        info!(provider = %settings.provider, "client started");
        Ok(Self {
            settings,
            store,
            auth,
            sessions,
            bookmarks,
            binding,
        })
    }

    /// Stops following the session, closes the change feed and the event pump.
    pub async fn shutdown(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.stop().await;
        }
        self.sessions.shutdown();
        info!("client stopped");
    }
}
