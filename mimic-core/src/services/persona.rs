//! services/persona.rs
//! Persona synthesis from a profile's posts, and the append-only personas table.
//!
//! The persona request is mandatory. The three example requests are built from
//! the generated persona text (not the posts) and each one may fail on its own;
//! a failed example becomes [`EXAMPLE_PLACEHOLDER`].

use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::services::blocks::{self, BlockError, Table};
use crate::services::model::{ChatMessage, ModelBackend, ModelError, ModelRequest};

pub const EXAMPLE_PLACEHOLDER: &str = "[generation failed]";
pub const POST_SEPARATOR: &str = "\n\n---\n\n";

pub const PERSONA_COLUMNS: [&str; 6] = [
    "profile_identity",
    "persona_text",
    "social_example",
    "email_example",
    "text_example",
    "created_at",
];

const PERSONA_SYSTEM: &str =
    "You are a data analyst that creates professional personas from public social media data.";

const PERSONA_PROMPT: &str = "Read the following public LinkedIn posts from a user and construct \
a detailed professional persona. Describe their communication style, recurring topics of \
interest, likely technical expertise, and overall tone. Be insightful and structured.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaRecord {
    pub profile_identity: String,
    pub persona_text: String,
    pub social_example: String,
    pub email_example: String,
    pub text_example: String,
    pub created_at: String,
}

impl PersonaRecord {
    pub fn to_row(&self) -> [&str; 6] {
        [
            self.profile_identity.as_str(),
            self.persona_text.as_str(),
            self.social_example.as_str(),
            self.email_example.as_str(),
            self.text_example.as_str(),
            self.created_at.as_str(),
        ]
    }

    fn from_row(table: &Table, row: &[String]) -> Self {
        let field = |name: &str| {
            table
                .column_index(name)
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default()
        };
        Self {
            profile_identity: field("profile_identity"),
            persona_text: field("persona_text"),
            social_example: field("social_example"),
            email_example: field("email_example"),
            text_example: field("text_example"),
            created_at: field("created_at"),
        }
    }

    /// Examples that fell back to the placeholder.
    pub fn failed_examples(&self) -> Vec<ExampleKind> {
        ExampleKind::ALL
            .into_iter()
            .filter(|k| self.example(*k) == EXAMPLE_PLACEHOLDER)
            .collect()
    }

    pub fn example(&self, kind: ExampleKind) -> &str {
        match kind {
            ExampleKind::Social => &self.social_example,
            ExampleKind::Email => &self.email_example,
            ExampleKind::Text => &self.text_example,
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no post content found for '{identity}'")]
    NoPosts { identity: String },
    #[error("persona generation failed for '{identity}': {source}")]
    GenerationFailed {
        identity: String,
        #[source]
        source: ModelError,
    },
    #[error("saving persona: {0}")]
    Persist(#[from] BlockError),
}

/// The three illustrative messages generated from a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExampleKind {
    Social,
    Email,
    Text,
}

impl ExampleKind {
    pub const ALL: [ExampleKind; 3] = [ExampleKind::Social, ExampleKind::Email, ExampleKind::Text];

    pub fn label(self) -> &'static str {
        match self {
            ExampleKind::Social => "social post",
            ExampleKind::Email => "professional email",
            ExampleKind::Text => "casual text",
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            ExampleKind::Social => {
                "A short, insightful LinkedIn post about 'the future of AI in threat intelligence'. \
                 Sign it with the user's name."
            }
            ExampleKind::Email => {
                "A concise, professional email to a colleague suggesting a new tool for the team's workflow."
            }
            ExampleKind::Text => {
                "A casual text message to a friend mentioning an interesting article they read."
            }
        }
    }

    fn sampling(self) -> (f32, u32) {
        match self {
            ExampleKind::Social => (0.7, 150),
            ExampleKind::Email => (0.7, 200),
            ExampleKind::Text => (0.8, 100),
        }
    }
}

/// Join the non-blank values of `column` into one text, posts separated by a
/// horizontal rule.
pub fn aggregate_posts(table: &Table, column: &str) -> String {
    table
        .column(column)
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join(POST_SEPARATOR)
}

/// First `max` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct PersonaSynthesizer<B: ModelBackend> {
    backend: B,
    model: String,
    char_budget: usize,
}

impl<B: ModelBackend> PersonaSynthesizer<B> {
    pub fn new(backend: B, cfg: &ModelConfig) -> Self {
        Self {
            backend,
            model: cfg.model.clone(),
            char_budget: cfg.persona_char_budget,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn persona_request(&self, posts: &str) -> ModelRequest {
        let posts = truncate_chars(posts, self.char_budget);
        ModelRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(PERSONA_SYSTEM),
                ChatMessage::user(format!("{PERSONA_PROMPT}\n\nPOSTS:\n{posts}")),
            ],
            temperature: 0.6,
            max_tokens: 1024,
        }
    }

    pub fn example_request(&self, persona: &str, kind: ExampleKind) -> ModelRequest {
        let (temperature, max_tokens) = kind.sampling();
        let prompt = format!(
            "You are a person with this exact persona:\n\n---\n{persona}\n---\n\n\
             Based *only* on this persona, write a realistic example of the following \
             communication: {}",
            kind.instruction()
        );
        ModelRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            temperature,
            max_tokens,
        }
    }

    pub fn synthesize(&self, identity: &str, posts: &str) -> Result<PersonaRecord, SynthesisError> {
        if posts.trim().is_empty() {
            return Err(SynthesisError::NoPosts {
                identity: identity.to_string(),
            });
        }

        tracing::info!(identity = %identity, "generating persona");
        let persona_text = self
            .backend
            .complete(&self.persona_request(posts))
            .map_err(|source| SynthesisError::GenerationFailed {
                identity: identity.to_string(),
                source,
            })?;

        let [social_example, email_example, text_example] =
            ExampleKind::ALL.map(|kind| self.example(identity, &persona_text, kind));

        Ok(PersonaRecord {
            profile_identity: identity.to_string(),
            persona_text,
            social_example,
            email_example,
            text_example,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn example(&self, identity: &str, persona: &str, kind: ExampleKind) -> String {
        match self.backend.complete(&self.example_request(persona, kind)) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    example = kind.label(),
                    error = %e,
                    "example generation failed"
                );
                EXAMPLE_PLACEHOLDER.to_string()
            }
        }
    }
}

/// Destination for generated personas. Rows are only ever appended.
pub trait PersonaStore {
    fn append(&self, record: &PersonaRecord) -> Result<(), BlockError>;
    fn load(&self) -> Result<Vec<PersonaRecord>, BlockError>;
}

#[derive(Debug, Clone)]
pub struct CsvPersonaStore {
    path: PathBuf,
}

impl CsvPersonaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersonaStore for CsvPersonaStore {
    fn append(&self, record: &PersonaRecord) -> Result<(), BlockError> {
        blocks::append_row(&self.path, &PERSONA_COLUMNS, &record.to_row())
    }

    /// Every stored record in file order. A missing file is an empty history.
    fn load(&self) -> Result<Vec<PersonaRecord>, BlockError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let table = blocks::read_table(&self.path)?;
        Ok(table
            .rows
            .iter()
            .map(|row| PersonaRecord::from_row(&table, row))
            .collect())
    }
}
