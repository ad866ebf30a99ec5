// src/commands/api.rs
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::commands::init::{ensure_initialized, write_atomic};
use crate::config::CoreConfig;
use crate::services::blocks::{BlockError, BlockFormat, ProfileBlocks};
use crate::services::credentials::{CredentialStore, FileCredentialStore};
use crate::services::gate::{AuthError, AuthSession, AuthState, GateEvent, GateOutcome, TotpGate};
use crate::services::model::{ModelBackend, OpenAiBackend};
use crate::services::persona::{
    aggregate_posts, CsvPersonaStore, PersonaRecord, PersonaStore, PersonaSynthesizer,
    SynthesisError,
};
use crate::services::scrape::{BatchReport, ScrapeDriver, ScrapeError};
use crate::utils::logbook::Logbook;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not authenticated; enter a valid TOTP code first")]
    NotAuthenticated,
    #[error("no profile identities given")]
    NoIdentities,
    #[error("no scraped data found at '{}'; run the scraper first", .0.display())]
    NoScrapedData(PathBuf),
    #[error("no scraped posts for '{0}'")]
    UnknownProfile(String),
    #[error("cookie file '{}' not found; configure cookies first", .0.display())]
    CookiesMissing(PathBuf),
    #[error("cookie setup failed: {0}")]
    Cookies(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Blocks(#[from] BlockError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("scraped data unreadable: {0}")]
    ScrapedDataUnreadable(String),
}

impl PipelineError {
    /// Copy of a stage-wide failure for one identity's slot in a batch.
    fn per_identity(&self) -> Self {
        match self {
            PipelineError::NoScrapedData(path) => PipelineError::NoScrapedData(path.clone()),
            other => PipelineError::ScrapedDataUnreadable(other.to_string()),
        }
    }
}

/// Which scraped profiles get a persona after a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersonaSelection {
    None,
    /// Every identity whose scrape completed.
    All,
    Only(Vec<String>),
}

#[derive(Debug, Default)]
pub struct PersonaBatch {
    pub results: Vec<(String, Result<PersonaRecord, PipelineError>)>,
}

impl PersonaBatch {
    pub fn generated(&self) -> impl Iterator<Item = &PersonaRecord> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PipelineError)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub scrape: BatchReport,
    pub personas: PersonaBatch,
}

#[derive(Debug, Clone)]
pub struct CookieReport {
    pub json_path: PathBuf,
    pub txt_path: PathBuf,
    pub converter_output: String,
}

/// Parse an identity list: a path to a file with one identity per line, or a
/// single identity.
pub fn collect_identities(input: &str) -> Result<Vec<String>, PipelineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PipelineError::NoIdentities);
    }
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(vec![input.to_string()]);
    }
    let ids: Vec<String> = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(PipelineError::NoIdentities);
    }
    Ok(ids)
}

/// Authenticated scrape-then-synthesize workflow over injected stores.
pub struct Pipeline<S: CredentialStore, B: ModelBackend, P: PersonaStore> {
    cfg: CoreConfig,
    gate: TotpGate<S>,
    driver: ScrapeDriver,
    format: BlockFormat,
    synthesizer: PersonaSynthesizer<B>,
    personas: P,
    logbook: Logbook,
}

impl Pipeline<FileCredentialStore, OpenAiBackend, CsvPersonaStore> {
    /// File-backed pipeline rooted at `root`, initializing the layout first.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let report = ensure_initialized(root)?;
        let cfg = report.config;
        let store = FileCredentialStore::open(&cfg.auth.secrets_path)?;
        let backend = OpenAiBackend::from_config(&cfg.model);
        let personas = CsvPersonaStore::new(&cfg.storage.personas_csv);
        let logbook = Logbook::open(cfg.logbook.actions());
        Ok(Self::new(cfg, store, backend, personas).with_logbook(logbook))
    }
}

impl<S: CredentialStore, B: ModelBackend, P: PersonaStore> Pipeline<S, B, P> {
    pub fn new(cfg: CoreConfig, store: S, backend: B, personas: P) -> Self {
        Self {
            gate: TotpGate::new(store, cfg.auth.clone()),
            driver: ScrapeDriver::from_config(&cfg.scraper, &cfg.storage),
            format: BlockFormat::new(cfg.storage.marker_prefix.clone()),
            synthesizer: PersonaSynthesizer::new(backend, &cfg.model),
            personas,
            logbook: Logbook::disabled(),
            cfg,
        }
    }

    pub fn with_logbook(mut self, logbook: Logbook) -> Self {
        self.gate = self.gate.with_logbook(logbook.clone());
        self.driver = self.driver.with_logbook(logbook.clone());
        self.logbook = logbook;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn gate(&self) -> &TotpGate<S> {
        &self.gate
    }

    pub fn logbook(&self) -> &Logbook {
        &self.logbook
    }

    // ---------- auth ----------

    pub fn auth_state(&self, session: &AuthSession, identity: &str) -> Result<AuthState, PipelineError> {
        Ok(self.gate.classify(session, identity)?)
    }

    pub fn authenticate(
        &self,
        session: AuthSession,
        identity: &str,
        event: GateEvent,
    ) -> Result<(AuthSession, GateOutcome), PipelineError> {
        Ok(self.gate.handle(session, identity, event)?)
    }

    fn require(session: &AuthSession) -> Result<(), PipelineError> {
        if session.authenticated {
            Ok(())
        } else {
            Err(PipelineError::NotAuthenticated)
        }
    }

    // ---------- cookies ----------

    /// Store exported browser cookies and convert them for the scraper.
    pub fn configure_cookies(
        &self,
        session: &AuthSession,
        json_text: &str,
    ) -> Result<CookieReport, PipelineError> {
        Self::require(session)?;
        if json_text.trim().is_empty() {
            return Err(PipelineError::Cookies("no cookie data provided".into()));
        }
        let value: serde_json::Value = serde_json::from_str(json_text)
            .map_err(|e| PipelineError::Cookies(format!("invalid JSON: {e}")))?;
        let pretty = serde_json::to_string_pretty(&value)
            .map_err(|e| PipelineError::Cookies(e.to_string()))?;

        let sc = &self.cfg.scraper;
        write_atomic(&sc.cookie_json, pretty.as_bytes())
            .map_err(|e| PipelineError::Cookies(format!("{e:#}")))?;
        tracing::info!(path = %sc.cookie_json.display(), "saved cookie JSON");

        let out = Command::new(&sc.converter_program)
            .args(&sc.converter_args)
            .current_dir(&sc.working_dir)
            .output()
            .map_err(|e| {
                PipelineError::Cookies(format!(
                    "could not run {:?}: {e}",
                    sc.converter_program
                ))
            })?;
        let converter_output = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
        if !out.status.success() || !sc.cookie_txt.exists() {
            tracing::warn!(status = ?out.status.code(), "cookie conversion failed");
            return Err(PipelineError::Cookies(format!(
                "conversion did not produce '{}': {}",
                sc.cookie_txt.display(),
                converter_output.trim()
            )));
        }

        self.logbook.record(
            "pipeline",
            "cookies_configured",
            json!({ "path": sc.cookie_txt.display().to_string() }),
        );
        Ok(CookieReport {
            json_path: sc.cookie_json.clone(),
            txt_path: sc.cookie_txt.clone(),
            converter_output,
        })
    }

    // ---------- scrape ----------

    pub fn scrape<T: AsRef<str>>(
        &self,
        session: &AuthSession,
        identities: &[T],
        confirm: &mut dyn FnMut(&Path) -> bool,
        sink: &mut dyn FnMut(&str, &str),
    ) -> Result<BatchReport, PipelineError> {
        Self::require(session)?;
        if identities.is_empty() {
            return Err(PipelineError::NoIdentities);
        }
        let sc = &self.cfg.scraper;
        if sc.require_cookies && !sc.cookie_txt.exists() {
            return Err(PipelineError::CookiesMissing(sc.cookie_txt.clone()));
        }
        Ok(self.driver.run_many(identities, confirm, sink)?)
    }

    /// Parse the aggregate posts file.
    pub fn profiles(&self) -> Result<ProfileBlocks, PipelineError> {
        let path = &self.cfg.storage.posts_csv;
        if !path.exists() {
            return Err(PipelineError::NoScrapedData(path.clone()));
        }
        Ok(self.format.parse_file(path)?)
    }

    // ---------- personas ----------

    pub fn generate_persona(
        &self,
        session: &AuthSession,
        identity: &str,
    ) -> Result<PersonaRecord, PipelineError> {
        Self::require(session)?;
        let profiles = self.profiles()?;
        self.persona_from(&profiles, identity)
    }

    /// One persona per identity. A failure is kept in the batch and the next
    /// identity still runs.
    pub fn generate_personas<T: AsRef<str>>(
        &self,
        session: &AuthSession,
        identities: &[T],
    ) -> Result<PersonaBatch, PipelineError> {
        Self::require(session)?;
        let profiles = self.profiles()?;
        Ok(self.persona_batch(&profiles, identities))
    }

    fn persona_batch<T: AsRef<str>>(&self, profiles: &ProfileBlocks, identities: &[T]) -> PersonaBatch {
        let results = identities
            .iter()
            .map(AsRef::as_ref)
            .map(|id| (id.to_string(), self.persona_from(profiles, id)))
            .collect();
        PersonaBatch { results }
    }

    fn persona_from(&self, profiles: &ProfileBlocks, identity: &str) -> Result<PersonaRecord, PipelineError> {
        let result = self.synthesize_and_store(profiles, identity);
        match &result {
            Ok(record) => {
                tracing::info!(identity = %identity, "persona saved");
                self.logbook.record(
                    "pipeline",
                    "persona_generated",
                    json!({
                        "identity": identity,
                        "failed_examples": record
                            .failed_examples()
                            .iter()
                            .map(|k| k.label())
                            .collect::<Vec<_>>(),
                    }),
                );
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "persona generation failed");
                self.logbook.record(
                    "pipeline",
                    "persona_failed",
                    json!({ "identity": identity, "error": e.to_string() }),
                );
            }
        }
        result
    }

    fn synthesize_and_store(
        &self,
        profiles: &ProfileBlocks,
        identity: &str,
    ) -> Result<PersonaRecord, PipelineError> {
        let table = profiles
            .get(identity)
            .ok_or_else(|| PipelineError::UnknownProfile(identity.to_string()))?;
        let posts = aggregate_posts(table, &self.cfg.storage.post_column);
        let record = self.synthesizer.synthesize(identity, &posts)?;
        self.personas
            .append(&record)
            .map_err(SynthesisError::Persist)?;
        Ok(record)
    }

    pub fn personas(&self, session: &AuthSession) -> Result<Vec<PersonaRecord>, PipelineError> {
        Self::require(session)?;
        Ok(self.personas.load()?)
    }

    // ---------- whole run ----------

    /// Scrape `identities`, then synthesize personas for `selection`.
    pub fn run<T: AsRef<str>>(
        &self,
        session: &AuthSession,
        identities: &[T],
        selection: &PersonaSelection,
        confirm: &mut dyn FnMut(&Path) -> bool,
        sink: &mut dyn FnMut(&str, &str),
    ) -> Result<RunReport, PipelineError> {
        let scrape = self.scrape(session, identities, confirm, sink)?;

        let chosen: Vec<String> = match selection {
            PersonaSelection::None => Vec::new(),
            PersonaSelection::All => scrape.succeeded().map(str::to_string).collect(),
            PersonaSelection::Only(ids) => ids.clone(),
        };
        if chosen.is_empty() {
            return Ok(RunReport { scrape, personas: PersonaBatch::default() });
        }
        // The scrape already ran; an unreadable posts file fails each chosen
        // identity instead of the whole run.
        let personas = match self.profiles() {
            Ok(profiles) => self.persona_batch(&profiles, chosen.as_slice()),
            Err(e) => {
                tracing::warn!(error = %e, "scraped data unavailable for persona stage");
                self.logbook.record(
                    "pipeline",
                    "persona_stage_failed",
                    json!({ "identities": chosen, "error": e.to_string() }),
                );
                let results = chosen
                    .into_iter()
                    .map(|id| (id, Err(e.per_identity())))
                    .collect();
                PersonaBatch { results }
            }
        };
        Ok(RunReport { scrape, personas })
    }
}
