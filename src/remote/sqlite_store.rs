//! Embedded row store backed by SQLite via `rusqlite`.
//!
//! Several clients may share one `SqliteStore` (behind an `Arc`); every
//! insert or delete is pushed to each open change-feed subscription whose
//! filter matches the affected row, so the store behaves like a shared
//! remote database with a realtime feed. Deletes are checked against the
//! acting owner, so one user can never remove another user's rows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChangeFeed, RowStore};
use crate::database::Database;
use crate::types::bookmark::{Bookmark, NewBookmark, Order, RowFilter, BOOKMARKS_TABLE};
use crate::types::errors::StoreError;
use crate::types::events::{ChangeEvent, ChangeKind, SubscriptionHandle};

struct Feed {
    channel: String,
    filter: RowFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

pub struct SqliteStore {
    db: Mutex<Database>,
    feeds: Mutex<HashMap<Uuid, Feed>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::with_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::with_database(Database::open_in_memory()?))
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Mutex::new(db),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open change-feed subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.feeds.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Channel names of the open subscriptions, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.feeds.lock() {
            Ok(feeds) => feeds.values().map(|f| f.channel.clone()).collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
    }

    fn check_table(table: &str) -> Result<(), StoreError> {
        if table == BOOKMARKS_TABLE {
            Ok(())
        } else {
            Err(StoreError::UnknownTable(table.to_string()))
        }
    }

    fn row_to_bookmark(row: &rusqlite::Row) -> rusqlite::Result<Bookmark> {
        let micros: i64 = row.get(4)?;
        let created_at = DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, micros))?;
        Ok(Bookmark {
            id: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
            user_id: row.get(3)?,
            created_at,
        })
    }

    fn select(conn: &Connection, filter: &RowFilter, order: Order) -> Result<Vec<Bookmark>, StoreError> {
        let (column, value) = match filter {
            RowFilter::Owner(owner) => ("user_id", owner),
            RowFilter::Id(id) => ("id", id),
        };
        let direction = match order {
            Order::NewestFirst => "DESC",
            Order::OldestFirst => "ASC",
        };
        let sql = format!(
            "SELECT id, title, url, user_id, created_at FROM bookmarks \
             WHERE {column} = ?1 ORDER BY created_at {direction}, seq {direction}"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], Self::row_to_bookmark)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delivers an event to every subscription whose filter covers the row.
    /// Subscriptions whose receiver is gone are dropped.
    fn publish(&self, event: ChangeEvent) {
        let Some(row) = event.row() else { return };
        let Ok(mut feeds) = self.feeds.lock() else { return };

        feeds.retain(|id, feed| {
            if !feed.filter.matches(row) {
                return true;
            }
            let delivered = feed.tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(subscription = %id, channel = %feed.channel, "dropping closed change feed");
            }
            delivered
        });
    }
}

#[async_trait]
impl RowStore for SqliteStore {
    async fn query(&self, table: &str, filter: &RowFilter, order: Order) -> Result<Vec<Bookmark>, StoreError> {
        Self::check_table(table)?;
        let db = self.db()?;
        Self::select(db.connection(), filter, order)
    }

    async fn insert(&self, table: &str, row: NewBookmark) -> Result<Bookmark, StoreError> {
        Self::check_table(table)?;
        if row.user_id.is_empty() {
            return Err(StoreError::Rejected("user_id must not be empty".to_string()));
        }

        let bookmark = {
            let db = self.db()?;
            let conn = db.connection();

            // Creation timestamps are strictly increasing so newest-first is total.
            let last: i64 = conn.query_row("SELECT COALESCE(MAX(created_at), 0) FROM bookmarks", [], |r| r.get(0))?;
            let micros = Utc::now().timestamp_micros().max(last + 1);
            let created_at = DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| StoreError::Database(format!("timestamp out of range: {}", micros)))?;

            let bookmark = Bookmark {
                id: Uuid::new_v4().to_string(),
                title: row.title,
                url: row.url,
                user_id: row.user_id,
                created_at,
            };

            conn.execute(
                "INSERT INTO bookmarks (id, user_id, title, url, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![bookmark.id, bookmark.user_id, bookmark.title, bookmark.url, micros],
            )?;
            bookmark
        };

        debug!(id = %bookmark.id, owner = %bookmark.user_id, "bookmark inserted");
        self.publish(ChangeEvent {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            old_row: None,
            new_row: Some(bookmark.clone()),
        });
        Ok(bookmark)
    }

    async fn delete(&self, table: &str, filter: &RowFilter, acting_owner: &str) -> Result<usize, StoreError> {
        Self::check_table(table)?;
        if acting_owner.is_empty() {
            return Err(StoreError::Rejected("acting owner must not be empty".to_string()));
        }

        let removed = {
            let db = self.db()?;
            let tx = db.connection().unchecked_transaction()?;
            let removed = Self::select(&tx, filter, Order::NewestFirst)?;

            // All or nothing: one foreign row refuses the whole delete.
            if let Some(foreign) = removed.iter().find(|b| b.user_id != acting_owner) {
                return Err(StoreError::Rejected(format!(
                    "bookmark {} is not owned by {}",
                    foreign.id, acting_owner
                )));
            }
            for bookmark in &removed {
                tx.execute("DELETE FROM bookmarks WHERE id = ?1", params![bookmark.id])?;
            }
            tx.commit()?;
            removed
        };

        debug!(%filter, owner = acting_owner, count = removed.len(), "bookmarks deleted");
        let count = removed.len();
        for bookmark in removed {
            self.publish(ChangeEvent {
                kind: ChangeKind::Delete,
                table: table.to_string(),
                old_row: Some(bookmark),
                new_row: None,
            });
        }
        Ok(count)
    }

    async fn subscribe_change_feed(
        &self,
        channel: &str,
        table: &str,
        filter: RowFilter,
    ) -> Result<ChangeFeed, StoreError> {
        Self::check_table(table)?;

        let (tx, events) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
        };

        info!(channel, %filter, subscription = %handle.id, "change feed opened");
        self.feeds
            .lock()
            .map_err(|_| StoreError::Database("feed registry lock poisoned".to_string()))?
            .insert(
                handle.id,
                Feed {
                    channel: channel.to_string(),
                    filter,
                    tx,
                },
            );

        Ok(ChangeFeed { handle, events })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StoreError> {
        let removed = self
            .feeds
            .lock()
            .map_err(|_| StoreError::Database("feed registry lock poisoned".to_string()))?
            .remove(&handle.id);

        match removed {
            Some(_) => {
                info!(channel = %handle.channel, subscription = %handle.id, "change feed closed");
                Ok(())
            }
            None => Err(StoreError::SubscriptionNotFound(handle.id)),
        }
    }
}
