//! Tests for configuration loading and the local settings store
//!
//! Covers:
//! - Missing TOML files fall back to defaults instead of failing
//! - Config path resolution priority (CLI → ENV → platform default)
//! - Session defaults round trip through the settings store
//! - Saving session defaults leaves the rest of the file's data intact
//!
//! Tests touching ANNOFORGE_CONFIG are marked #[serial] so they do not race
//! on the process environment.

use annoforge_common::config::{
    load_toml_config, resolve_config_path, write_toml_config, SessionDefaults, SettingsStore,
    TomlConfig, CONFIG_ENV_VAR, CONFIG_FILE_NAME,
};
use annoforge_common::Error;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_missing_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_invalid_toml_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[generation\nworker_limit = ").unwrap();

    match load_toml_config(&path) {
        Err(Error::TomlParse { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("Expected TomlParse error, got {:?}", other),
    }
}

#[test]
fn test_write_then_load_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("annoforge.toml");

    let mut config = TomlConfig::default();
    config.generation.worker_limit = 3;
    config.inference.command = Some("florence2-caption".to_string());
    config.session.last_model = Some("florence-2-large".to_string());

    write_toml_config(&config, &path).unwrap();
    let loaded = load_toml_config(&path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
#[serial]
fn test_env_var_overrides_platform_default() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/annoforge-env-test.toml");
    let path = resolve_config_path(None);
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(path, PathBuf::from("/tmp/annoforge-env-test.toml"));
}

#[test]
#[serial]
fn test_cli_overrides_env_var() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/annoforge-env-test.toml");
    let path = resolve_config_path(Some(Path::new("/tmp/annoforge-cli.toml")));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(path, PathBuf::from("/tmp/annoforge-cli.toml"));
}

#[test]
#[serial]
fn test_platform_default_file_name() {
    env::remove_var(CONFIG_ENV_VAR);
    let path = resolve_config_path(None);
    assert!(path.ends_with(CONFIG_FILE_NAME));
}

#[test]
fn test_settings_store_defaults_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let store = SettingsStore::new(temp_dir.path().join("annoforge.toml"));

    let defaults = store.load_defaults().unwrap();
    assert_eq!(defaults, SessionDefaults::default());
}

#[test]
fn test_settings_store_save_and_reload() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("annoforge.toml");
    let store = SettingsStore::new(&path);

    let defaults = SessionDefaults {
        last_model: Some("florence-2-base-ft".to_string()),
        default_prompt_type: "caption".to_string(),
    };

    assert!(store.save_defaults(&defaults).unwrap(), "first save writes");
    assert!(!store.save_defaults(&defaults).unwrap(), "unchanged save is skipped");

    let reopened = SettingsStore::new(&path);
    assert_eq!(reopened.load_defaults().unwrap(), defaults);
}

#[test]
fn test_settings_store_preserves_other_tables() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("annoforge.toml");

    let mut config = TomlConfig::default();
    config.generation.worker_limit = 6;
    write_toml_config(&config, &path).unwrap();

    let store = SettingsStore::new(&path);
    store
        .save_defaults(&SessionDefaults {
            last_model: Some("m".to_string()),
            default_prompt_type: "style_tags".to_string(),
        })
        .unwrap();

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded.generation.worker_limit, 6);
    assert_eq!(loaded.session.default_prompt_type, "style_tags");
}

#[test]
fn test_settings_store_keeps_unknown_tables_and_keys() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("annoforge.toml");
    std::fs::write(
        &path,
        r#"
[custom]
keep = 7

[generation]
worker_limit = 3
future_option = "on"

[session]
default_prompt_type = "caption"
"#,
    )
    .unwrap();

    let store = SettingsStore::new(&path);
    assert!(store
        .save_defaults(&SessionDefaults {
            last_model: Some("florence-2-large".to_string()),
            default_prompt_type: "caption".to_string(),
        })
        .unwrap());

    let table: toml::Table = std::fs::read_to_string(&path).unwrap().parse().unwrap();
    assert_eq!(table["custom"]["keep"].as_integer(), Some(7));
    assert_eq!(table["generation"]["worker_limit"].as_integer(), Some(3));
    assert_eq!(table["generation"]["future_option"].as_str(), Some("on"));
    assert_eq!(table["session"]["last_model"].as_str(), Some("florence-2-large"));

    assert_eq!(load_toml_config(&path).unwrap().generation.worker_limit, 3);
}

#[test]
fn test_settings_store_rejects_invalid_session_table() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("annoforge.toml");
    std::fs::write(&path, "[session]\ndefault_prompt_type = 5\n").unwrap();

    let result = SettingsStore::new(&path).save_defaults(&SessionDefaults::default());
    assert!(matches!(result, Err(Error::TomlParse { .. })), "{:?}", result);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "[session]\ndefault_prompt_type = 5\n"
    );
}
