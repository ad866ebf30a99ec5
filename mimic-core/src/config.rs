use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

pub const CONFIG_FILE: &str = "mimic.toml";
pub const DOTENV_FILE: &str = ".env";

/// Load `<root>/.env` into the process environment. Variables already set
/// win. Returns the file path when one was read.
pub fn load_dotenv(root: &Path) -> Result<Option<PathBuf>> {
    let path = root.join(DOTENV_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    dotenvy::from_path(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded environment file");
    Ok(Some(path))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        cfg.auth.normalize();
        Ok(cfg)
    }

    /// Defaults with every path resolved against `root`. Handy for tests.
    pub fn rooted(root: &Path) -> Self {
        let mut cfg = CoreConfig::default();
        cfg.resolve_paths(root);
        cfg.auth.normalize();
        cfg
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.auth.secrets_path = absolutize(root, &self.auth.secrets_path);
        self.scraper.cookie_json = absolutize(root, &self.scraper.cookie_json);
        self.scraper.cookie_txt = absolutize(root, &self.scraper.cookie_txt);
        self.scraper.working_dir = absolutize(root, &self.scraper.working_dir);
        self.storage.posts_csv = absolutize(root, &self.storage.posts_csv);
        self.storage.personas_csv = absolutize(root, &self.storage.personas_csv);
        self.logbook.path = absolutize(root, &self.logbook.path);
        self.logbook.logs_dir = absolutize(root, &self.logbook.logs_dir);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "AuthConfig::default_secrets_path")]
    pub secrets_path: PathBuf,
    #[serde(default = "AuthConfig::default_issuer")]
    pub issuer: String,
    #[serde(default = "AuthConfig::default_step_seconds")]
    pub step_seconds: u64,
    #[serde(default = "AuthConfig::default_digits")]
    pub digits: u32,
    #[serde(default = "AuthConfig::default_skew_steps")]
    pub skew_steps: u64,
}

impl AuthConfig {
    fn default_secrets_path() -> PathBuf {
        PathBuf::from("analysis/totp_secrets.txt")
    }

    fn default_issuer() -> String {
        "haKC.ai - AnythingYouCanDo App".to_string()
    }

    fn default_step_seconds() -> u64 {
        30
    }

    fn default_digits() -> u32 {
        6
    }

    fn default_skew_steps() -> u64 {
        1
    }

    /// Codes are 6 to 9 digits and the step is at least one second. Applied at
    /// load so the verifier and the provisioning URI see the same values.
    pub fn normalize(&mut self) {
        let digits = self.digits.clamp(6, 9);
        if digits != self.digits {
            tracing::warn!(configured = self.digits, using = digits, "auth.digits out of range");
            self.digits = digits;
        }
        if self.step_seconds == 0 {
            tracing::warn!("auth.step_seconds is 0; using 1");
            self.step_seconds = 1;
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secrets_path: Self::default_secrets_path(),
            issuer: Self::default_issuer(),
            step_seconds: Self::default_step_seconds(),
            digits: Self::default_digits(),
            skew_steps: Self::default_skew_steps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "ScraperConfig::default_program")]
    pub program: PathBuf,
    #[serde(default = "ScraperConfig::default_args")]
    pub args: Vec<String>,
    #[serde(default = "ScraperConfig::default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "ScraperConfig::default_finish_sentinel")]
    pub finish_sentinel: String,
    #[serde(default = "ScraperConfig::default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub yield_ms: u64,
    #[serde(default = "ScraperConfig::default_cookie_json")]
    pub cookie_json: PathBuf,
    #[serde(default = "ScraperConfig::default_cookie_txt")]
    pub cookie_txt: PathBuf,
    #[serde(default = "ScraperConfig::default_true")]
    pub require_cookies: bool,
    #[serde(default = "ScraperConfig::default_program")]
    pub converter_program: PathBuf,
    #[serde(default = "ScraperConfig::default_converter_args")]
    pub converter_args: Vec<String>,
}

impl ScraperConfig {
    fn default_program() -> PathBuf {
        PathBuf::from("python3")
    }

    fn default_args() -> Vec<String> {
        vec!["LIS/gimme.py".to_string()]
    }

    fn default_working_dir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_finish_sentinel() -> String {
        "[*] Finished".to_string()
    }

    fn default_ignore_patterns() -> Vec<String> {
        [
            "NotOpenSSLWarning",
            "chromedriver version",
            "LibreSSL",
            "See: https://github.com/urllib3/urllib3/issues/3020",
            " warnings.warn(",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_cookie_json() -> PathBuf {
        PathBuf::from("LIS/lnkedin_cookies.json")
    }

    fn default_cookie_txt() -> PathBuf {
        PathBuf::from("LIS/lnkedin_cookies.txt")
    }

    fn default_true() -> bool {
        true
    }

    fn default_converter_args() -> Vec<String> {
        vec!["LIS/convert.py".to_string()]
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            working_dir: Self::default_working_dir(),
            finish_sentinel: Self::default_finish_sentinel(),
            ignore_patterns: Self::default_ignore_patterns(),
            yield_ms: 0,
            cookie_json: Self::default_cookie_json(),
            cookie_txt: Self::default_cookie_txt(),
            require_cookies: true,
            converter_program: Self::default_program(),
            converter_args: Self::default_converter_args(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_posts_csv")]
    pub posts_csv: PathBuf,
    #[serde(default = "StorageConfig::default_personas_csv")]
    pub personas_csv: PathBuf,
    #[serde(default = "StorageConfig::default_marker_prefix")]
    pub marker_prefix: String,
    #[serde(default = "StorageConfig::default_post_column")]
    pub post_column: String,
}

impl StorageConfig {
    fn default_posts_csv() -> PathBuf {
        PathBuf::from("LIS/user_posts_extended.csv")
    }

    fn default_personas_csv() -> PathBuf {
        PathBuf::from("LIS/personas.csv")
    }

    fn default_marker_prefix() -> String {
        "linked_in_profile_name".to_string()
    }

    fn default_post_column() -> String {
        "Post_Content".to_string()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            posts_csv: Self::default_posts_csv(),
            personas_csv: Self::default_personas_csv(),
            marker_prefix: Self::default_marker_prefix(),
            post_column: Self::default_post_column(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "ModelConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "ModelConfig::default_model")]
    pub model: String,
    #[serde(default = "ModelConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "ModelConfig::default_persona_char_budget")]
    pub persona_char_budget: usize,
}

impl ModelConfig {
    fn default_endpoint() -> String {
        "https://api.openai.com/v1/chat/completions".to_string()
    }

    fn default_model() -> String {
        "gpt-4o".to_string()
    }

    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    fn default_persona_char_budget() -> usize {
        8000
    }

    /// API key from the environment variable named by `api_key_env`.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            persona_char_budget: Self::default_persona_char_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "LogbookConfig::default_logs_dir")]
    pub logs_dir: PathBuf,
}

impl LogbookConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("analysis/logbook")
    }

    fn default_logs_dir() -> PathBuf {
        PathBuf::from("analysis/logs")
    }

    pub fn actions(&self) -> PathBuf {
        self.path.join("actions.jsonl")
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            logs_dir: Self::default_logs_dir(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
