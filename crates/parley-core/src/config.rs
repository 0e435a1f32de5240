use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use parley_providers::{RetryPolicy, GEMINI_PROVIDER_ID};

use crate::context::DEFAULT_CONTEXT_WINDOW;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and keep replies focused on the user's question.";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            context_window: default_context_window(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub allow_registration: bool,
    #[serde(default)]
    pub cookie_secure: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            allow_registration: true,
            cookie_secure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UiTheme {
    #[default]
    Dark,
    Light,
}

impl UiTheme {
    pub fn as_str(self) -> &'static str {
        match self {
            UiTheme::Dark => "dark",
            UiTheme::Light => "light",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default)]
    pub theme: UiTheme,
    #[serde(default = "default_ui_title")]
    pub title: String,
    #[serde(default = "default_accent")]
    pub accent: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: UiTheme::default(),
            title: default_ui_title(),
            accent: default_accent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_context_window() -> usize {
    DEFAULT_CONTEXT_WINDOW
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_true() -> bool {
    true
}

fn default_ui_title() -> String {
    "Parley".to_string()
}

fn default_accent() -> String {
    "#4f8cff".to_string()
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration. Later layers win:
/// global file, project file, environment, runtime patches, CLI flags.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "effective config is invalid; using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        for layer in [
            &layers.global,
            &layers.project,
            &layers.env,
            &layers.runtime,
            &layers.cli,
        ] {
            deep_merge(&mut merged, layer);
        }
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops provider keys from a persisted layer when the environment already
/// supplies one, so rotating the env key is never shadowed by a stale file.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        if provider_has_runtime_secret(provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_env_candidates(provider_id).into_iter().any(|key| {
        std::env::var(&key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    })
}

fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();

    let mut out = vec![format!("{}_API_KEY", normalized)];
    if provider_id.eq_ignore_ascii_case(GEMINI_PROVIDER_ID) {
        out.push("GOOGLE_API_KEY".to_string());
    }
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("PARLEY_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("parley").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".parley/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    // No url or model defaults here, they would mask the file layers below.
    if let Some(api_key) = var("GEMINI_API_KEY").or_else(|| var("GOOGLE_API_KEY")) {
        deep_merge(
            &mut root,
            &json!({ "providers": { GEMINI_PROVIDER_ID: { "api_key": api_key.trim() } } }),
        );
    }
    if let Some(model) = var("GEMINI_MODEL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { GEMINI_PROVIDER_ID: { "default_model": model.trim() } } }),
        );
    }
    if let Some(prompt) = var("PARLEY_SYSTEM_PROMPT") {
        deep_merge(&mut root, &json!({ "chat": { "system_prompt": prompt } }));
    }
    if let Some(window) = var("PARLEY_CONTEXT_WINDOW").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "chat": { "context_window": window } }));
    }
    if let Some(theme) = var("PARLEY_THEME") {
        let theme = theme.trim().to_ascii_lowercase();
        if matches!(theme.as_str(), "dark" | "light") {
            deep_merge(&mut root, &json!({ "ui": { "theme": theme } }));
        }
    }
    if let Some(enabled) = var("PARLEY_ALLOW_REGISTRATION").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "auth": { "allow_registration": enabled } }));
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

impl From<ProviderConfig> for parley_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: value.api_key,
            url: value.url,
            default_model: value.default_model,
        }
    }
}

impl From<AppConfig> for parley_providers::AppConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value
                .providers
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            default_provider: value.default_provider,
            retry: value.chat.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("parley-core-config-{name}-{}", Uuid::new_v4()))
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config: AppConfig = serde_json::from_value(json!({})).expect("config");
        assert_eq!(config.chat.context_window, 10);
        assert_eq!(config.chat.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.auth.session_ttl_secs, 86_400);
        assert!(config.auth.allow_registration);
        assert!(!config.auth.cookie_secure);
        assert_eq!(config.ui.theme, UiTheme::Dark);
        assert_eq!(config.chat.retry, RetryPolicy::default());
    }

    #[test]
    fn deep_merge_overlays_nested_keys_and_skips_nulls() {
        let mut base = json!({
            "chat": {"system_prompt": "a", "context_window": 10},
            "ui": {"theme": "dark"}
        });
        deep_merge(
            &mut base,
            &json!({"chat": {"context_window": 4, "system_prompt": null}, "ui": "flat"}),
        );
        assert_eq!(base["chat"]["system_prompt"], "a");
        assert_eq!(base["chat"]["context_window"], 4);
        assert_eq!(base["ui"], "flat");
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let vars = HashMap::from([
            ("GEMINI_API_KEY", " AIza-env "),
            ("GEMINI_MODEL", "gemini-2.5-pro"),
            ("PARLEY_CONTEXT_WINDOW", "6"),
            ("PARLEY_THEME", "Light"),
            ("PARLEY_ALLOW_REGISTRATION", "off"),
            ("PARLEY_SYSTEM_PROMPT", "Talk like a pirate."),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        let config: AppConfig = serde_json::from_value(layer).expect("config");
        let gemini = config.providers.get(GEMINI_PROVIDER_ID).expect("gemini");
        assert_eq!(gemini.api_key.as_deref(), Some("AIza-env"));
        assert_eq!(gemini.default_model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(config.chat.context_window, 6);
        assert_eq!(config.chat.system_prompt, "Talk like a pirate.");
        assert_eq!(config.ui.theme, UiTheme::Light);
        assert!(!config.auth.allow_registration);
    }

    #[tokio::test]
    async fn env_key_keeps_configured_url_and_model() {
        let dir = scratch_dir("env-key");
        let project = dir.join("config.json");
        fs::create_dir_all(&dir).await.expect("dir");
        fs::write(
            &project,
            r#"{"providers":{"gemini":{"url":"https://proxy.internal/v1beta","default_model":"gemini-2.5-pro"}}}"#,
        )
        .await
        .expect("project");
        let store = ConfigStore::with_global_path(&project, dir.join("global.json"), None)
            .await
            .expect("store");

        let vars = HashMap::from([("GEMINI_API_KEY", "AIza-env")]);
        let env = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        store.layers.write().await.env = env;

        let config = store.get().await;
        let gemini = config.providers.get(GEMINI_PROVIDER_ID).expect("gemini");
        assert_eq!(gemini.api_key.as_deref(), Some("AIza-env"));
        assert_eq!(gemini.url.as_deref(), Some("https://proxy.internal/v1beta"));
        assert_eq!(gemini.default_model.as_deref(), Some("gemini-2.5-pro"));
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn env_layer_ignores_blank_and_invalid_values() {
        let vars = HashMap::from([
            ("GEMINI_API_KEY", "   "),
            ("PARLEY_CONTEXT_WINDOW", "lots"),
            ("PARLEY_THEME", "neon"),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(layer, json!({}));
    }

    #[tokio::test]
    async fn cli_layer_wins_over_project_and_global() {
        let dir = scratch_dir("layers");
        let global = dir.join("global.json");
        let project = dir.join("state").join("config.json");
        fs::create_dir_all(&dir).await.expect("dir");
        fs::write(&global, r##"{"ui":{"title":"Global","accent":"#000000"}}"##)
            .await
            .expect("global");
        fs::create_dir_all(project.parent().expect("parent"))
            .await
            .expect("state dir");
        fs::write(&project, r#"{"ui":{"title":"Project"}}"#)
            .await
            .expect("project");

        let store = ConfigStore::with_global_path(
            &project,
            &global,
            Some(json!({"chat": {"context_window": 3}})),
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.ui.title, "Project");
        assert_eq!(config.ui.accent, "#000000");
        assert_eq!(config.chat.context_window, 3);

        store
            .patch_runtime(json!({"ui": {"title": "Runtime"}}))
            .await
            .expect("runtime");
        assert_eq!(store.get().await.ui.title, "Runtime");
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn patch_project_persists_to_disk() {
        let dir = scratch_dir("persist");
        let project = dir.join("config.json");
        let store = ConfigStore::with_global_path(&project, dir.join("global.json"), None)
            .await
            .expect("store");
        store
            .patch_project(json!({"auth": {"allow_registration": false}}))
            .await
            .expect("patch");

        let raw = fs::read_to_string(&project).await.expect("read");
        let persisted: Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(persisted["auth"]["allow_registration"], false);
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn strip_keeps_keys_for_providers_without_env_secret() {
        let mut value = json!({
            "providers": {"parley_test_unset_provider": {"api_key": "file-secret"}}
        });
        strip_persisted_secrets(&mut value);
        assert_eq!(
            value["providers"]["parley_test_unset_provider"]["api_key"],
            "file-secret"
        );
    }

    #[test]
    fn provider_config_converts_with_retry_policy() {
        let mut config = AppConfig::default();
        config.chat.retry.max_retries = 1;
        config.providers.insert(
            GEMINI_PROVIDER_ID.to_string(),
            ProviderConfig {
                api_key: Some("k".to_string()),
                url: None,
                default_model: None,
            },
        );
        let converted: parley_providers::AppConfig = config.into();
        assert_eq!(converted.retry.max_retries, 1);
        assert!(converted.providers.contains_key(GEMINI_PROVIDER_ID));
    }
}
