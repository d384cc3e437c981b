use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

const AVATAR_FALLBACK_BASE: &str = "https://ui-avatars.com/api/";

/// A live authenticated identity bound to this client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: String,
    pub avatar_url: String,
    /// Provider-supplied profile fields, kept verbatim.
    pub profile: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What the identity provider hands back when a sign-in completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserProfile {
    pub user_id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl UserProfile {
    pub fn new(user_id: &str, email: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.map(str::to_string),
            metadata: Map::new(),
        }
    }

    /// Adds a metadata field, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

impl Session {
    /// Builds a session from a provider profile, resolving the display name
    /// and avatar from the usual OAuth metadata keys.
    pub fn from_profile(profile: UserProfile, expires_at: Option<DateTime<Utc>>) -> Self {
        let display_name = metadata_str(&profile.metadata, &["full_name", "name"])
            .or_else(|| profile.email.clone())
            .unwrap_or_else(|| profile.user_id.clone());

        let avatar_url = metadata_str(&profile.metadata, &["avatar_url", "picture"])
            .unwrap_or_else(|| initials_avatar_url(&display_name));

        Self {
            user_id: profile.user_id,
            email: profile.email,
            display_name,
            avatar_url,
            profile: profile.metadata,
            expires_at,
        }
    }

    /// Returns true if the session carries an expiry that has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// First non-empty string value among `keys`.
fn metadata_str(metadata: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| metadata.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Generated avatar for profiles without a picture.
pub fn initials_avatar_url(display_name: &str) -> String {
    match Url::parse_with_params(AVATAR_FALLBACK_BASE, &[("name", display_name)]) {
        Ok(url) => url.to_string(),
        Err(_) => AVATAR_FALLBACK_BASE.to_string(),
    }
}

/// Which provider to authenticate against and where it should send the user back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: String,
    pub redirect_to: String,
}
