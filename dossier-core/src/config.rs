//! Configuration system for Dossier.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DossierConfig {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub fetch: FetchConfig,
    pub context: ContextConfig,
    pub workflow: WorkflowConfig,
}

impl DossierConfig {
    /// Collect warnings from every section.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.llm.validate() {
            warnings.push(format!("[llm] {w}"));
        }
        for w in self.search.validate() {
            warnings.push(format!("[search] {w}"));
        }
        for w in self.fetch.validate() {
            warnings.push(format!("[fetch] {w}"));
        }
        for w in self.context.validate() {
            warnings.push(format!("[context] {w}"));
        }
        for w in self.workflow.validate() {
            warnings.push(format!("[workflow] {w}"));
        }
        warnings
    }

    /// Directory for session files, defaulting under the user data dir.
    pub fn session_dir(&self) -> PathBuf {
        self.context
            .store_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("sessions"))
    }

    /// Directory for run checkpoints, defaulting under the user data dir.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.workflow
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("runs"))
    }
}

/// One OpenAI-compatible model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Name used in logs, traces and provider preference.
    pub name: String,
    pub model: String,
    /// Base URL (defaults to the OpenAI API).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

fn default_temperature() -> f32 {
    0.2
}

/// LLM gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Providers in fallback order.
    pub providers: Vec<LlmProviderConfig>,
    /// Attempts per provider before failing over.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Timeout applied to every provider call.
    pub timeout_secs: u64,
    /// Consecutive failures before a provider's circuit opens.
    pub failure_threshold: usize,
    pub recovery_timeout_secs: u64,
    /// Requests per minute per provider (0 = unlimited).
    pub requests_per_minute: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                LlmProviderConfig {
                    name: "openai".to_string(),
                    model: "gpt-4o".to_string(),
                    base_url: None,
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    temperature: default_temperature(),
                    max_tokens: Some(4096),
                },
                LlmProviderConfig {
                    name: "openai-mini".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    base_url: None,
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    temperature: default_temperature(),
                    max_tokens: Some(4096),
                },
            ],
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 32_000,
            timeout_secs: 60,
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            requests_per_minute: 0,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.providers.is_empty() {
            warnings.push("no providers configured; every model call will fail".to_string());
        }
        if self.max_attempts == 0 {
            warnings.push("max_attempts is 0; treated as 1".to_string());
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            warnings.push(format!(
                "backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every call will time out".to_string());
        }
        for p in &self.providers {
            if !(0.0..=2.0).contains(&p.temperature) {
                warnings.push(format!(
                    "provider '{}' temperature ({}) is outside the typical range 0.0-2.0",
                    p.name, p.temperature
                ));
            }
        }
        warnings
    }
}

/// Supported search backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    Tavily,
    DuckDuckGo,
}

/// One search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProviderConfig {
    pub kind: SearchProviderKind,
    /// Environment variable holding the API key, if the backend needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Search gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Providers in priority order.
    pub providers: Vec<SearchProviderConfig>,
    /// Timeout applied to every provider call.
    pub timeout_secs: u64,
    /// Results requested per sub-query.
    pub results_per_query: usize,
    pub failure_threshold: usize,
    pub recovery_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                SearchProviderConfig {
                    kind: SearchProviderKind::Tavily,
                    api_key_env: Some("TAVILY_API_KEY".to_string()),
                    base_url: None,
                },
                SearchProviderConfig {
                    kind: SearchProviderKind::DuckDuckGo,
                    api_key_env: None,
                    base_url: None,
                },
            ],
            timeout_secs: 15,
            results_per_query: 5,
            failure_threshold: 3,
            recovery_timeout_secs: 120,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.providers.is_empty() {
            warnings.push("no providers configured; every search will be empty".to_string());
        }
        if self.results_per_query == 0 {
            warnings.push("results_per_query is 0; searches will return nothing".to_string());
        }
        warnings
    }
}

/// Page fetch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Extracted text is truncated to this many characters.
    pub max_content_chars: usize,
    /// Sources with less text than this are dropped.
    pub min_content_chars: usize,
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_content_chars: 8_000,
            min_content_chars: 100,
            user_agent: format!("Dossier/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 5,
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.min_content_chars >= self.max_content_chars {
            warnings.push(format!(
                "min_content_chars ({}) >= max_content_chars ({}); every source will be dropped",
                self.min_content_chars, self.max_content_chars
            ));
        }
        warnings
    }
}

/// Session history configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Where session files live (defaults to the user data dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
    /// Turns retained per session.
    pub max_turns: usize,
    /// Most recent turns fed into the context summary.
    pub history_window: usize,
    /// Turns older than this are left out of the summary (0 = no limit).
    pub max_age_days: u32,
    pub summary_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_turns: 50,
            history_window: 5,
            max_age_days: 30,
            summary_max_chars: 1_200,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.history_window == 0 {
            warnings.push("history_window is 0; follow-ups will not see prior turns".to_string());
        }
        if self.history_window > self.max_turns {
            warnings.push(format!(
                "history_window ({}) exceeds max_turns ({})",
                self.history_window, self.max_turns
            ));
        }
        warnings
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Revised-query retries after an empty search.
    pub search_retry_ceiling: u32,
    /// Concurrent fetches and summarizations.
    pub fan_out: usize,
    pub max_sub_queries: usize,
    /// Source budget when the request does not set one.
    pub default_max_sources: usize,
    pub max_references: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            search_retry_ceiling: 2,
            fan_out: 5,
            max_sub_queries: 5,
            default_max_sources: 10,
            max_references: 10,
            checkpoint_dir: None,
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.fan_out == 0 {
            warnings.push("fan_out is 0; treated as 1".to_string());
        }
        if self.search_retry_ceiling > 10 {
            warnings.push(format!(
                "search_retry_ceiling ({}) is unusually large",
                self.search_retry_ceiling
            ));
        }
        if self.max_references == 0 {
            warnings.push("max_references is 0; briefs will carry no citations".to_string());
        }
        warnings
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "dossier", "dossier")
}

/// The user data directory (`~/.local/share/dossier` on Linux).
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".dossier"))
}

/// Load configuration with layered merging.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DOSSIER_`)
/// 3. Workspace-local config (`.dossier/config.toml`)
/// 4. User config (`~/.config/dossier/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DossierConfig>,
) -> Result<DossierConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DossierConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".dossier").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DOSSIER_WORKFLOW__FAN_OUT, DOSSIER_LLM__TIMEOUT_SECS, ...
    figment = figment.merge(Env::prefixed("DOSSIER_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(dirs) = project_dirs()
        && dirs.config_dir().join("config.toml").exists()
    {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(".dossier").join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DossierConfig::default();
        assert_eq!(config.workflow.search_retry_ceiling, 2);
        assert_eq!(config.workflow.fan_out, 5);
        assert_eq!(config.context.max_turns, 50);
        assert_eq!(config.context.max_age_days, 30);
        assert_eq!(config.fetch.max_content_chars, 8_000);
        assert_eq!(config.llm.providers[0].name, "openai");
        assert_eq!(config.search.providers[1].kind, SearchProviderKind::DuckDuckGo);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = DossierConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: DossierConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DossierConfig = toml::from_str(
            r#"
            [workflow]
            fan_out = 2

            [[search.providers]]
            kind = "duckduckgo"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.workflow.fan_out, 2);
        assert_eq!(parsed.workflow.max_references, 10);
        assert_eq!(parsed.search.providers.len(), 1);
        assert_eq!(parsed.search.timeout_secs, 15);
    }

    #[test]
    fn test_workspace_config_layer() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".dossier");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[workflow]\nsearch_retry_ceiling = 4\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.workflow.search_retry_ceiling, 4);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = DossierConfig::default();
        overrides.context.history_window = 2;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.context.history_window, 2);
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = DossierConfig::default();
        config.workflow.fan_out = 0;
        config.llm.providers.clear();
        config.fetch.min_content_chars = 10_000;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.starts_with("[workflow] fan_out")));
        assert!(warnings.iter().any(|w| w.starts_with("[llm] no providers")));
        assert!(warnings.iter().any(|w| w.starts_with("[fetch]")));
    }

    #[test]
    fn test_storage_dirs_follow_config() {
        let mut config = DossierConfig::default();
        config.context.store_dir = Some(PathBuf::from("/tmp/sessions"));
        assert_eq!(config.session_dir(), PathBuf::from("/tmp/sessions"));
        assert!(config.checkpoint_dir().ends_with("runs"));
    }
}
