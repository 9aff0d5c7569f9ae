//! Integration tests for Configuration System

use gamewiki::config::ConfigLoader;
use gamewiki::provider::ProviderType;
use gamewiki::sites::SiteTable;
use gamewiki::{EngineKey, GameContext};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

// Serializes HOME/GAMEWIKI_* env access across parallel tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const WORKSPACE_CONFIG: &str = r#"
[provider]
provider_type = "ollama"
model = "qwen2.5:7b"

[query]
engine_wait_timeout_ms = 3000

[[sites]]
title = "Elden Ring"
engine_key = "eldenring"
wiki_base_url = "https://eldenring.wiki.fextralife.com/"

[[sites]]
title = "Elden Ring Nightreign"
engine_key = "nightreign"
wiki_base_url = "https://eldenringnightreign.wiki.fextralife.com/"

[[sites]]
title = "Stardew Valley"
wiki_base_url = "stardewvalleywiki.com/Stardew_Valley_Wiki"
"#;

fn workspace_with_config() -> TempDir {
    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), WORKSPACE_CONFIG).unwrap();
    workspace
}

#[test]
fn test_workspace_config_builds_site_table() {
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let home = TempDir::new().unwrap();
    std::env::set_var("HOME", home.path());
    let workspace = workspace_with_config();

    let config = ConfigLoader::load(workspace.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.provider.provider_type, ProviderType::Ollama);
    assert_eq!(config.query.engine_wait_timeout(), Duration::from_secs(3));
    // untouched settings keep their defaults
    assert_eq!(config.query.top_k, 3);

    let table = SiteTable::from_config(&config);
    // the longer title wins over its prefix
    assert_eq!(
        table.engine_key_for_context(&GameContext::new("ELDEN RING NIGHTREIGN")),
        Some(EngineKey::new("nightreign"))
    );
    assert_eq!(
        table.engine_key_for_context(&GameContext::new("Elden Ring")),
        Some(EngineKey::new("eldenring"))
    );
    assert_eq!(
        table.wiki_domain_for_context(&GameContext::new("Stardew Valley")),
        Some("stardewvalleywiki.com".to_string())
    );
    assert!(table.is_supported(&GameContext::new("Stardew Valley")));
    assert!(!table.is_supported(&GameContext::new("Terminal")));
}

#[test]
fn test_environment_overrides_files() {
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let home = TempDir::new().unwrap();
    std::env::set_var("HOME", home.path());
    let workspace = workspace_with_config();

    std::env::set_var("GAMEWIKI__QUERY__TOP_K", "7");
    std::env::set_var("GAMEWIKI__PROVIDER__MODEL", "llama3.1");
    let loaded = ConfigLoader::load(workspace.path());
    std::env::remove_var("GAMEWIKI__QUERY__TOP_K");
    std::env::remove_var("GAMEWIKI__PROVIDER__MODEL");

    let config = loaded.unwrap();
    assert_eq!(config.query.top_k, 7);
    assert_eq!(config.provider.model, "llama3.1");
    assert_eq!(config.query.engine_wait_timeout_ms, 3000);
}

#[test]
fn test_env_specific_file_layers_over_base() {
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let home = TempDir::new().unwrap();
    std::env::set_var("HOME", home.path());
    let workspace = workspace_with_config();
    std::fs::write(
        workspace.path().join("config").join("staging.toml"),
        "[grounding]\nenabled = true\n\n[query]\nstream_retries = 0\n",
    )
    .unwrap();

    std::env::set_var("GAMEWIKI_ENV", "staging");
    let loaded = ConfigLoader::load(workspace.path());
    std::env::remove_var("GAMEWIKI_ENV");

    let config = loaded.unwrap();
    assert!(config.grounding.enabled);
    assert_eq!(config.query.stream_retries, 0);
    assert_eq!(config.sites.len(), 3);
}

#[test]
fn test_invalid_site_is_reported() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.toml");
    std::fs::write(&path, "[[sites]]\ntitle = \"Orphan Game\"\n").unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("Orphan Game"));
    assert!(config.validated().is_err());
}
