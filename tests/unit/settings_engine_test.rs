//! Unit tests for the Smartmark settings engine.

use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

use smartmark::services::settings_engine::{SettingsEngine, SettingsEngineTrait, DEFAULT_CONFIG_FILE};
use smartmark::types::errors::SettingsError;
use smartmark::types::settings::ClientSettings;

fn engine_in(dir: &TempDir) -> SettingsEngine {
    let path = dir.path().join("config").join("smartmark.json");
    SettingsEngine::new(Some(path.to_string_lossy().into_owned()))
}

#[test]
fn test_default_config_path() {
    let engine = SettingsEngine::new(None);
    assert_eq!(engine.get_config_path(), DEFAULT_CONFIG_FILE);
}

#[test]
fn test_load_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);

    let settings = engine.load().unwrap();
    assert_eq!(settings, ClientSettings::default());
    assert_eq!(settings.sign_in_path, "/");
    assert_eq!(settings.dashboard_path, "/dashboard");
    assert_eq!(settings.channel_prefix, "bookmarks");
}

#[test]
fn test_set_value_persists_across_engines() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    engine.load().unwrap();
    engine.set_value("site_origin", json!("https://marks.example.com")).unwrap();

    let mut reloaded = engine_in(&dir);
    let settings = reloaded.load().unwrap();
    assert_eq!(settings.site_origin, "https://marks.example.com");
    assert_eq!(
        settings.provider_config().unwrap().redirect_to,
        "https://marks.example.com/dashboard"
    );
}

#[test]
fn test_partial_file_fills_defaults() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::write(engine.get_config_path(), r#"{"provider": "github"}"#).unwrap();

    let mut engine = engine;
    let settings = engine.load().unwrap();
    assert_eq!(settings.provider, "github");
    assert_eq!(settings.dashboard_path, "/dashboard");
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::write(engine.get_config_path(), "{not json").unwrap();

    assert!(matches!(engine.load(), Err(SettingsError::Serialization(_))));
}

#[test]
fn test_unknown_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    assert!(matches!(
        engine.set_value("theme", json!("dark")),
        Err(SettingsError::InvalidKey(_))
    ));
    assert!(matches!(engine.set_value("", json!("x")), Err(SettingsError::InvalidKey(_))));
}

#[rstest]
#[case("dashboard_path", json!("dashboard"))]
#[case("sign_in_path", json!("/dashboard"))]
#[case("site_origin", json!("not a url"))]
#[case("provider", json!(""))]
#[case("channel_prefix", json!(42))]
fn test_invalid_values_are_rejected(#[case] key: &str, #[case] value: serde_json::Value) {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);

    assert!(matches!(engine.set_value(key, value), Err(SettingsError::InvalidValue(_))));
    assert_eq!(engine.get_settings(), &ClientSettings::default(), "failed update changes nothing");
}

#[test]
fn test_database_path_accepts_null() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    engine.set_value("database_path", json!("/tmp/marks.db")).unwrap();
    engine.set_value("database_path", json!(null)).unwrap();
    assert_eq!(engine.get_settings().database_path, None);
}

#[test]
fn test_reset_restores_defaults() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    engine.set_value("provider", json!("github")).unwrap();
    engine.reset().unwrap();

    let mut reloaded = engine_in(&dir);
    assert_eq!(reloaded.load().unwrap(), ClientSettings::default());
}

#[test]
fn test_env_overrides_apply_without_saving() {
    let dir = TempDir::new().unwrap();
    let mut engine = engine_in(&dir);
    engine.load().unwrap();

    std::env::set_var("SMARTMARK_PROVIDER", "gitlab");
    let result = engine.apply_env_overrides();
    std::env::remove_var("SMARTMARK_PROVIDER");
    result.unwrap();

    assert_eq!(engine.get_settings().provider, "gitlab");
    let mut reloaded = engine_in(&dir);
    assert_eq!(reloaded.load().unwrap().provider, "google");
}
