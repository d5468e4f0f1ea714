//! Layered configuration: environment variables take priority over a
//! workspace-local config file, which takes priority over a global config
//! file, which takes priority over built-in defaults.

use anyhow::{Context, Result};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// On-disk config file shape, shared by the workspace-local and global files.
#[derive(Debug, Clone, Serialize, Deserialize, Default, Validate)]
pub struct FileConfig {
    #[serde(default)]
    #[garde(length(max = 200))]
    pub default_model: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub api_key: Option<String>,
    #[serde(default)]
    #[garde(length(max = 2000))]
    pub base_url: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub proxy: Option<String>,
    #[serde(default)]
    #[garde(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f64>,
    #[serde(default)]
    #[garde(skip)]
    pub reasoning: Option<bool>,
    #[serde(default)]
    #[garde(skip)]
    pub debug: Option<bool>,
    #[serde(default)]
    #[garde(skip)]
    pub system_prompt: Option<String>,
}

/// Fully resolved configuration for a single run, after applying the
/// env > local > global > default precedence chain.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub proxy: Option<String>,
    pub temperature: Option<f64>,
    pub reasoning: bool,
    pub debug: bool,
    pub system_prompt: Option<String>,
}

impl ResolvedConfig {
    /// Resolve configuration for the given workspace root.
    pub fn resolve(workspace_root: &std::path::Path) -> Self {
        let local = load_local_config(workspace_root).unwrap_or_default();
        let global = load_global_config().unwrap_or_default();

        let model = std::env::var("ANURIS_MODEL")
            .ok()
            .or(local.default_model.clone())
            .or(global.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let api_key = std::env::var("ANURIS_API_KEY")
            .ok()
            .or(local.api_key.clone())
            .or(global.api_key.clone());

        let base_url = std::env::var("ANURIS_BASE_URL")
            .ok()
            .or(local.base_url.clone())
            .or(global.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let proxy = std::env::var("ANURIS_PROXY")
            .ok()
            .or(local.proxy.clone())
            .or(global.proxy.clone());

        let temperature = std::env::var("ANURIS_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(local.temperature)
            .or(global.temperature);

        let reasoning = std::env::var("ANURIS_REASONING")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(local.reasoning)
            .or(global.reasoning)
            .unwrap_or(false);

        let debug = std::env::var("ANURIS_DEBUG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(local.debug)
            .or(global.debug)
            .unwrap_or(false);

        let system_prompt = std::env::var("ANURIS_SYSTEM_PROMPT")
            .ok()
            .or(local.system_prompt.clone())
            .or(global.system_prompt.clone());

        Self {
            model,
            api_key,
            base_url,
            proxy,
            temperature,
            reasoning,
            debug,
            system_prompt,
        }
    }
}

fn local_config_path(workspace_root: &std::path::Path) -> PathBuf {
    workspace_root.join(".anuris").join("config.json")
}

fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("failed to resolve global config directory")?
        .join("anuris");
    Ok(config_dir.join("config.json"))
}

/// Load the workspace-local config from `<workspace>/.anuris/config.json`.
pub fn load_local_config(workspace_root: &std::path::Path) -> Result<FileConfig> {
    let path = local_config_path(workspace_root);
    let contents = std::fs::read_to_string(&path).context("failed to read local config")?;
    let config: FileConfig = serde_json::from_str(&contents).context("failed to parse local config")?;
    config.validate().context("local config failed validation")?;
    Ok(config)
}

/// Load the global config from `~/.config/anuris/config.json`.
pub fn load_global_config() -> Result<FileConfig> {
    let path = global_config_path()?;
    let contents = std::fs::read_to_string(&path).context("failed to read global config")?;
    let config: FileConfig = serde_json::from_str(&contents).context("failed to parse global config")?;
    config.validate().context("global config failed validation")?;
    Ok(config)
}

/// Save the workspace-local config.
pub fn save_local_config(workspace_root: &std::path::Path, config: &FileConfig) -> Result<()> {
    let path = local_config_path(workspace_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create local config directory")?;
    }
    let contents = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents).context("failed to write local config")
}

/// Save the global config.
pub fn save_global_config(config: &FileConfig) -> Result<()> {
    let path = global_config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create global config directory")?;
    }
    let contents = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents).context("failed to write global config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    /// Serializes tests that mutate ANURIS_* env vars to prevent races.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var("ANURIS_MODEL");
        env::remove_var("ANURIS_API_KEY");
        env::remove_var("ANURIS_BASE_URL");
        env::remove_var("ANURIS_PROXY");
    }

    #[test]
    fn resolve_uses_default_when_nothing_set() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let resolved = ResolvedConfig::resolve(dir.path());
        assert_eq!(resolved.model, DEFAULT_MODEL);
        assert_eq!(resolved.base_url, DEFAULT_BASE_URL);
        assert!(resolved.api_key.is_none());
    }

    #[test]
    fn resolve_env_overrides_local_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        save_local_config(
            dir.path(),
            &FileConfig {
                default_model: Some("local-model".into()),
                ..Default::default()
            },
        )
        .unwrap();

        env::set_var("ANURIS_MODEL", "env-model");
        let resolved = ResolvedConfig::resolve(dir.path());
        assert_eq!(resolved.model, "env-model");

        clear_env();
        let resolved = ResolvedConfig::resolve(dir.path());
        assert_eq!(resolved.model, "local-model");
    }

    #[test]
    fn resolve_reads_ambient_fields() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::remove_var("ANURIS_TEMPERATURE");
        env::remove_var("ANURIS_REASONING");
        env::remove_var("ANURIS_DEBUG");
        env::remove_var("ANURIS_SYSTEM_PROMPT");
        let dir = tempfile::tempdir().unwrap();

        let resolved = ResolvedConfig::resolve(dir.path());
        assert_eq!(resolved.temperature, None);
        assert!(!resolved.reasoning);
        assert!(!resolved.debug);
        assert_eq!(resolved.system_prompt, None);

        env::set_var("ANURIS_TEMPERATURE", "0.5");
        env::set_var("ANURIS_REASONING", "true");
        env::set_var("ANURIS_DEBUG", "1");
        let resolved = ResolvedConfig::resolve(dir.path());
        assert_eq!(resolved.temperature, Some(0.5));
        assert!(resolved.reasoning);
        assert!(resolved.debug);

        env::remove_var("ANURIS_TEMPERATURE");
        env::remove_var("ANURIS_REASONING");
        env::remove_var("ANURIS_DEBUG");
    }
}
