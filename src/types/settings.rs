use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::SettingsError;
use super::session::ProviderConfig;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    /// Row store database file. `None` keeps the store in memory.
    pub database_path: Option<String>,
    /// Origin the identity provider redirects back to.
    pub site_origin: String,
    /// Where unauthenticated visitors are sent.
    pub sign_in_path: String,
    /// The protected bookmark view.
    pub dashboard_path: String,
    /// Identity provider name handed to the auth backend.
    pub provider: String,
    /// Prefix of change-feed channel names (`<prefix>-<user id>`).
    pub channel_prefix: String,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            site_origin: "http://localhost:3000".to_string(),
            sign_in_path: "/".to_string(),
            dashboard_path: "/dashboard".to_string(),
            provider: "google".to_string(),
            channel_prefix: "bookmarks".to_string(),
            log_filter: "smartmark=info".to_string(),
        }
    }
}

impl ClientSettings {
    /// Provider request redirecting back to the dashboard on this origin.
    pub fn provider_config(&self) -> Result<ProviderConfig, SettingsError> {
        let origin = Url::parse(&self.site_origin)
            .map_err(|e| SettingsError::InvalidValue(format!("site_origin '{}': {}", self.site_origin, e)))?;
        let redirect = origin
            .join(&self.dashboard_path)
            .map_err(|e| SettingsError::InvalidValue(format!("dashboard_path '{}': {}", self.dashboard_path, e)))?;
        Ok(ProviderConfig {
            provider: self.provider.clone(),
            redirect_to: redirect.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.provider_config()?;
        for (key, path) in [("sign_in_path", &self.sign_in_path), ("dashboard_path", &self.dashboard_path)] {
            if !path.starts_with('/') {
                return Err(SettingsError::InvalidValue(format!("{} must start with '/': {}", key, path)));
            }
        }
        if self.sign_in_path == self.dashboard_path {
            return Err(SettingsError::InvalidValue(
                "sign_in_path and dashboard_path must differ".to_string(),
            ));
        }
        if self.provider.is_empty() || self.channel_prefix.is_empty() {
            return Err(SettingsError::InvalidValue("provider and channel_prefix must be set".to_string()));
        }
        Ok(())
    }
}
