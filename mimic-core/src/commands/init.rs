// mimic-core/src/commands/init.rs

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, CoreConfig};

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
    pub config: CoreConfig,
}

/// Resolve the data root. Allow override via MIMIC_ROOT (tests/scripts).
pub fn default_root() -> PathBuf {
    std::env::var_os("MIMIC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Ensure the data layout under `root` exists (idempotent). Safe to call often.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let mut layout = Layout::new(root);
    layout.dir(root)?;
    layout.file(&root.join(CONFIG_FILE), DEFAULT_CONFIG_TOML.as_bytes())?;

    let config = CoreConfig::load(root)?;

    for dir in [
        Some(config.logbook.path.as_path()),
        Some(config.logbook.logs_dir.as_path()),
        config.auth.secrets_path.parent(),
        config.storage.posts_csv.parent(),
        config.storage.personas_csv.parent(),
    ]
    .into_iter()
    .flatten()
    {
        layout.dir(dir)?;
    }
    // Credential records are appended later.
    layout.file(&config.auth.secrets_path, b"")?;

    Ok(InitReport {
        root: root.to_path_buf(),
        created: layout.created,
        existed: layout.existed,
        config,
    })
}

/// What `ensure_initialized` found or made, labelled relative to the root.
struct Layout<'a> {
    root: &'a Path,
    created: Vec<String>,
    existed: Vec<String>,
}

impl<'a> Layout<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            created: Vec::new(),
            existed: Vec::new(),
        }
    }

    fn note(&mut self, path: &Path, fresh: bool) {
        let label = match path.strip_prefix(self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
            _ => path.display().to_string(),
        };
        if fresh {
            self.created.push(label);
        } else {
            self.existed.push(label);
        }
    }

    fn dir(&mut self, path: &Path) -> Result<()> {
        let fresh = !path.is_dir();
        if fresh {
            fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))?;
        }
        self.note(path, fresh);
        Ok(())
    }

    /// Seed `path` with `seed` unless something is already there.
    fn file(&mut self, path: &Path, seed: &[u8]) -> Result<()> {
        let fresh = !path.exists();
        if fresh {
            write_atomic(path, seed)?;
        }
        self.note(path, fresh);
        Ok(())
    }
}

/// Write through a sibling `.tmp` file and rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let staged = path.with_extension("tmp");
    let mut out = fs::File::create(&staged)
        .with_context(|| format!("staging {}", staged.display()))?;
    out.write_all(bytes)?;
    out.sync_all()?;
    drop(out);
    fs::rename(&staged, path)
        .with_context(|| format!("replacing {} with {}", path.display(), staged.display()))?;
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[auth]
secrets_path = "analysis/totp_secrets.txt"
issuer = "haKC.ai - AnythingYouCanDo App"
step_seconds = 30
digits = 6
skew_steps = 1

[scraper]
program = "python3"
args = ["LIS/gimme.py"]
finish_sentinel = "[*] Finished"
yield_ms = 0
cookie_json = "LIS/lnkedin_cookies.json"
cookie_txt = "LIS/lnkedin_cookies.txt"
require_cookies = true
converter_program = "python3"
converter_args = ["LIS/convert.py"]

[storage]
posts_csv = "LIS/user_posts_extended.csv"
personas_csv = "LIS/personas.csv"
marker_prefix = "linked_in_profile_name"
post_column = "Post_Content"

[model]
endpoint = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o"
api_key_env = "OPENAI_API_KEY"
persona_char_budget = 8000

[logbook]
path = "analysis/logbook"
logs_dir = "analysis/logs"
"#;
