use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the only table the row store serves.
pub const BOOKMARKS_TABLE: &str = "bookmarks";

/// A saved link as assigned by the row store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookmark {
    pub id: String,
    pub title: String,
    pub url: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the client on insert. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    pub user_id: String,
}

impl NewBookmark {
    pub fn new(user_id: &str, title: &str, url: &str) -> Self {
        Self {
            title: title.to_string(),
            url: url.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

/// Row filter understood by the store. Every read issued by the core is
/// scoped with [`RowFilter::Owner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFilter {
    /// `user_id = <owner>`
    Owner(String),
    /// `id = <bookmark id>`
    Id(String),
}

impl RowFilter {
    pub fn owner(user_id: &str) -> Self {
        RowFilter::Owner(user_id.to_string())
    }

    pub fn id(id: &str) -> Self {
        RowFilter::Id(id.to_string())
    }

    /// Returns true if the bookmark falls inside this filter.
    pub fn matches(&self, bookmark: &Bookmark) -> bool {
        match self {
            RowFilter::Owner(owner) => &bookmark.user_id == owner,
            RowFilter::Id(id) => &bookmark.id == id,
        }
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowFilter::Owner(owner) => write!(f, "user_id=eq.{}", owner),
            RowFilter::Id(id) => write!(f, "id=eq.{}", id),
        }
    }
}

/// Result ordering for queries. Only the creation timestamp is sortable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Order {
    #[default]
    NewestFirst,
    OldestFirst,
}
