//! services/gate.rs
//! Per-client TOTP enrollment and login.
//!
//! The gate owns no session state. Callers hold an [`AuthSession`], hand it to
//! [`TotpGate::handle`] together with an event, and keep whatever session comes
//! back. On error the caller's session is untouched, so a rejected code leaves
//! the client waiting for another attempt.

use serde_json::json;
use std::io;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::services::credentials::CredentialStore;
use crate::services::totp::{self, SecretError, Totp};
use crate::utils::logbook::Logbook;

/// Ephemeral per-connection auth state. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthSession {
    pub authenticated: bool,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unregistered,
    /// A credential exists and no code flow has started yet.
    Registered,
    AwaitingCode,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// "I need a code": mint and store a new secret.
    Enroll,
    /// "I already have a code": go straight to code entry.
    HaveCode,
    SubmitCode(String),
}

/// Material an operator needs to add the secret to an authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub identity: String,
    pub secret: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Enrolled(Enrollment),
    Pending,
    Authenticated,
    AlreadyAuthenticated,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no TOTP secret registered for {identity}; enroll first")]
    NoCredential { identity: String },
    #[error("invalid code")]
    InvalidCode,
    #[error("enter your TOTP code to proceed")]
    EmptyCode,
    #[error("{identity} is already enrolled; submit a code instead")]
    AlreadyEnrolled { identity: String },
    #[error("stored secret for {identity} is unusable: {source}")]
    InvalidSecret {
        identity: String,
        #[source]
        source: SecretError,
    },
    #[error("credential ledger: {0}")]
    Io(#[from] io::Error),
}

impl AuthError {
    /// Errors after which the same session may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::InvalidCode | AuthError::EmptyCode)
    }
}

pub struct TotpGate<S: CredentialStore> {
    store: S,
    cfg: AuthConfig,
    logbook: Logbook,
}

impl<S: CredentialStore> TotpGate<S> {
    pub fn new(store: S, cfg: AuthConfig) -> Self {
        Self {
            store,
            cfg,
            logbook: Logbook::disabled(),
        }
    }

    pub fn with_logbook(mut self, logbook: Logbook) -> Self {
        self.logbook = logbook;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Where `identity` stands given the session it holds.
    pub fn classify(&self, session: &AuthSession, identity: &str) -> Result<AuthState, AuthError> {
        if session.authenticated {
            return Ok(AuthState::Authenticated);
        }
        if session.pending {
            return Ok(AuthState::AwaitingCode);
        }
        if self.store.is_known(identity)? {
            Ok(AuthState::Registered)
        } else {
            Ok(AuthState::Unregistered)
        }
    }

    pub fn handle(
        &self,
        session: AuthSession,
        identity: &str,
        event: GateEvent,
    ) -> Result<(AuthSession, GateOutcome), AuthError> {
        self.handle_at(session, identity, event, totp::unix_now())
    }

    /// Same as [`handle`](Self::handle) with an explicit clock.
    pub fn handle_at(
        &self,
        session: AuthSession,
        identity: &str,
        event: GateEvent,
        unix_secs: u64,
    ) -> Result<(AuthSession, GateOutcome), AuthError> {
        let state = self.classify(&session, identity)?;
        match (state, event) {
            (AuthState::Authenticated, _) => Ok((session, GateOutcome::AlreadyAuthenticated)),

            (AuthState::Unregistered, GateEvent::Enroll) => {
                let enrollment = self.enroll(identity)?;
                Ok((awaiting(), GateOutcome::Enrolled(enrollment)))
            }
            (AuthState::Registered, GateEvent::Enroll) => Err(AuthError::AlreadyEnrolled {
                identity: identity.to_string(),
            }),
            (AuthState::AwaitingCode, GateEvent::Enroll) => Ok((session, GateOutcome::Pending)),

            (_, GateEvent::HaveCode) => Ok((awaiting(), GateOutcome::Pending)),

            (AuthState::Unregistered, GateEvent::SubmitCode(_)) => Err(AuthError::NoCredential {
                identity: identity.to_string(),
            }),
            (AuthState::Registered | AuthState::AwaitingCode, GateEvent::SubmitCode(code)) => {
                self.verify(identity, &code, unix_secs)?;
                Ok((
                    AuthSession {
                        authenticated: true,
                        pending: false,
                    },
                    GateOutcome::Authenticated,
                ))
            }
        }
    }

    /// Mint a secret, append it to the ledger, and build the provisioning URI.
    /// The ledger write completes before the URI is handed out.
    fn enroll(&self, identity: &str) -> Result<Enrollment, AuthError> {
        let secret = totp::generate_secret();
        self.store.append(identity, &secret)?;
        let uri = totp::provisioning_uri(&secret, identity, &self.cfg.issuer, &self.cfg);
        tracing::info!(identity = %identity, "enrolled new TOTP secret");
        self.logbook.record("gate", "enroll", json!({ "identity": identity }));
        Ok(Enrollment {
            identity: identity.to_string(),
            secret,
            uri,
        })
    }

    fn verify(&self, identity: &str, code: &str, unix_secs: u64) -> Result<(), AuthError> {
        let secret = self
            .store
            .lookup(identity)?
            .ok_or_else(|| AuthError::NoCredential {
                identity: identity.to_string(),
            })?;
        if code.trim().is_empty() {
            return Err(AuthError::EmptyCode);
        }
        let totp = Totp::from_base32(&secret)
            .map_err(|source| AuthError::InvalidSecret {
                identity: identity.to_string(),
                source,
            })?
            .with_config(&self.cfg);
        if !totp.verify_at(code, unix_secs) {
            tracing::warn!(identity = %identity, "rejected TOTP code");
            self.logbook
                .record("gate", "login_rejected", json!({ "identity": identity }));
            return Err(AuthError::InvalidCode);
        }
        tracing::info!(identity = %identity, "authenticated");
        self.logbook.record("gate", "login_ok", json!({ "identity": identity }));
        Ok(())
    }
}

fn awaiting() -> AuthSession {
    AuthSession {
        authenticated: false,
        pending: true,
    }
}
