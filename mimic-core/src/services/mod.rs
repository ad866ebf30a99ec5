// src/services/mod.rs

pub mod totp;
pub mod credentials;  // append-only identity::secret ledger
pub mod gate;         // enrollment/login transitions over the ledger
pub mod scrape;       // external scraper process, one identity at a time
pub mod blocks;       // multi-block CSV parse/write, single-table append
pub mod model;
pub mod persona;

// Public API
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use gate::{AuthError, AuthSession, AuthState, GateEvent, GateOutcome, TotpGate};
pub use scrape::{BatchReport, ScrapeDriver, ScrapeError, ScrapeOutcome};
pub use blocks::{BlockError, BlockFormat, ProfileBlocks, Table};
pub use model::{ModelBackend, ModelError, ModelRequest, OpenAiBackend};
pub use persona::{CsvPersonaStore, PersonaRecord, PersonaStore, PersonaSynthesizer, SynthesisError};
