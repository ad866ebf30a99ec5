//! services/totp.rs
//! RFC 4226 / RFC 6238 one-time codes over HMAC-SHA1, plus the `otpauth://`
//! provisioning URI understood by common authenticator apps.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::AuthConfig;

/// 160 bits; encodes to exactly 32 base32 characters.
pub const SECRET_BYTES: usize = 20;

// RFC 3986 unreserved characters stay literal.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid base32 secret: {0}")]
pub struct SecretError(pub String);

/// Fresh random secret, base32 without padding.
pub fn generate_secret() -> String {
    let mut key = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    BASE32_NOPAD.encode(&key)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Totp {
    key: Vec<u8>,
    digits: u32,
    step: u64,
    skew: u64,
}

impl Totp {
    /// Decode a base32 secret. Case, `=` padding and spaces are ignored.
    pub fn from_base32(secret: &str) -> Result<Self, SecretError> {
        let cleaned: String = secret
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.is_empty() {
            return Err(SecretError("empty".into()));
        }
        let key = BASE32_NOPAD
            .decode(cleaned.as_bytes())
            .map_err(|e| SecretError(e.to_string()))?;
        Ok(Self {
            key,
            digits: 6,
            step: 30,
            skew: 1,
        })
    }

    /// Takes the code shape from `cfg` as given; see [`AuthConfig::normalize`].
    pub fn with_config(mut self, cfg: &AuthConfig) -> Self {
        self.digits = cfg.digits;
        self.step = cfg.step_seconds.max(1);
        self.skew = cfg.skew_steps;
        self
    }

    /// HOTP value for an explicit counter, zero-padded to `digits`.
    pub fn hotp(&self, counter: u64) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match <Hmac<Sha1>>::new_from_slice(&self.key) {
            Ok(m) => m,
            Err(_) => return String::new(),
        };
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);
        let code = u64::from(binary) % 10u64.checked_pow(self.digits).unwrap_or(u64::MAX);
        format!("{:0width$}", code, width = self.digits as usize)
    }

    pub fn code_at(&self, unix_secs: u64) -> String {
        self.hotp(unix_secs / self.step)
    }

    /// Accepts the code for the current step or any step within the skew window.
    pub fn verify_at(&self, code: &str, unix_secs: u64) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let counter = unix_secs / self.step;
        let lo = counter.saturating_sub(self.skew);
        let hi = counter.saturating_add(self.skew);
        (lo..=hi).any(|c| constant_time_eq(self.hotp(c).as_bytes(), code.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `otpauth://totp/<issuer>:<account>?secret=..&issuer=..`
pub fn provisioning_uri(secret: &str, account: &str, issuer: &str, cfg: &AuthConfig) -> String {
    let label = format!(
        "{}:{}",
        utf8_percent_encode(issuer, URI_COMPONENT),
        utf8_percent_encode(account, URI_COMPONENT)
    );
    let mut uri = format!(
        "otpauth://totp/{label}?secret={secret}&issuer={}",
        utf8_percent_encode(issuer, URI_COMPONENT)
    );
    // Defaults are left implicit so older authenticators don't choke.
    if cfg.digits != 6 {
        uri.push_str(&format!("&digits={}", cfg.digits));
    }
    if cfg.step_seconds != 30 {
        uri.push_str(&format!("&period={}", cfg.step_seconds));
    }
    uri
}
