// Smartmark Settings Engine
// Loads client settings from a JSON file, applies environment overrides,
// updates individual values and persists them back to disk.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::types::errors::SettingsError;
use crate::types::settings::ClientSettings;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "smartmark.json";

/// Environment variables that override file values, by settings key.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SMARTMARK_DATABASE_PATH", "database_path"),
    ("SMARTMARK_SITE_ORIGIN", "site_origin"),
    ("SMARTMARK_PROVIDER", "provider"),
    ("SMARTMARK_LOG", "log_filter"),
];

/// Trait defining the settings engine interface.
pub trait SettingsEngineTrait {
    fn load(&mut self) -> Result<ClientSettings, SettingsError>;
    fn save(&self) -> Result<(), SettingsError>;
    fn get_settings(&self) -> &ClientSettings;
    fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<(), SettingsError>;
    fn apply_env_overrides(&mut self) -> Result<(), SettingsError>;
    fn reset(&mut self) -> Result<(), SettingsError>;
    fn get_config_path(&self) -> &str;
}

/// Settings engine persisting [`ClientSettings`] as JSON on disk.
pub struct SettingsEngine {
    config_path: String,
    settings: ClientSettings,
}

impl SettingsEngine {
    /// Creates a new SettingsEngine reading `path_override`, or
    /// [`DEFAULT_CONFIG_FILE`] in the working directory.
    pub fn new(path_override: Option<String>) -> Self {
        Self {
            config_path: path_override.unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string()),
            settings: ClientSettings::default(),
        }
    }

    /// Sets `key` in memory only, validating the result.
    fn update(&mut self, key: &str, value: serde_json::Value) -> Result<(), SettingsError> {
        if key.is_empty() {
            return Err(SettingsError::InvalidKey("Key cannot be empty".to_string()));
        }

        let mut json_value = serde_json::to_value(&self.settings).map_err(|e| {
            SettingsError::Serialization(format!("Failed to serialize settings: {}", e))
        })?;

        match json_value.as_object_mut() {
            Some(map) if map.contains_key(key) => {
                map.insert(key.to_string(), value);
            }
            _ => {
                return Err(SettingsError::InvalidKey(format!(
                    "Key '{}' not found in settings",
                    key
                )))
            }
        }

        let new_settings: ClientSettings = serde_json::from_value(json_value).map_err(|e| {
            SettingsError::InvalidValue(format!("Invalid value for key '{}': {}", key, e))
        })?;
        new_settings.validate()?;

        self.settings = new_settings;
        Ok(())
    }
}

impl SettingsEngineTrait for SettingsEngine {
    /// Loads settings from the JSON config file.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    fn load(&mut self) -> Result<ClientSettings, SettingsError> {
        let path = Path::new(&self.config_path);

        if !path.exists() {
            debug!(path = %self.config_path, "no config file, using defaults");
            self.settings = ClientSettings::default();
            return Ok(self.settings.clone());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("Failed to read config file: {}", e)))?;

        let settings: ClientSettings = serde_json::from_str(&content).map_err(|e| {
            SettingsError::Serialization(format!("Failed to parse config file: {}", e))
        })?;
        settings.validate()?;

        self.settings = settings;
        Ok(self.settings.clone())
    }

    /// Saves the current settings, creating parent directories as needed.
    fn save(&self) -> Result<(), SettingsError> {
        let path = Path::new(&self.config_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SettingsError::Io(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(&self.settings).map_err(|e| {
            SettingsError::Serialization(format!("Failed to serialize settings: {}", e))
        })?;

        fs::write(path, json)
            .map_err(|e| SettingsError::Io(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn get_settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Updates one top-level setting and saves to disk.
    ///
    /// # Examples
    /// - `"site_origin"` → `json!("https://marks.example.com")`
    /// - `"database_path"` → `json!(null)` for an in-memory store
    fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<(), SettingsError> {
        self.update(key, value)?;
        self.save()
    }

    /// Applies [`ENV_OVERRIDES`]. Overrides are not written back to disk.
    fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = std::env::var(var) {
                debug!(var, key, "settings override from environment");
                self.update(key, serde_json::Value::String(value))?;
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), SettingsError> {
        self.settings = ClientSettings::default();
        self.save()
    }

    fn get_config_path(&self) -> &str {
        &self.config_path
    }
}
