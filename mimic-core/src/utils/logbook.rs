// src/utils/logbook.rs
//! Append-only JSONL record of domain events (enrollments, logins, scrapes,
//! persona runs). Writes are best-effort: a failed append is reported through
//! `tracing` and never fails the caller.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use uuid::Uuid;

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    session: &'a str,
    component: &'a str,
    event: &'a str,
    details: &'a Value,
}

#[derive(Debug, Clone)]
pub struct Logbook {
    path: Option<PathBuf>,
    session: String,
}

impl Logbook {
    /// Logbook appending to `path` (parent directories are created on demand).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            session: Uuid::new_v4().to_string(),
        }
    }

    /// A logbook that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: None,
            session: Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, component: &str, event: &str, details: Value) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(e) = self.append(path, component, event, &details) {
            tracing::warn!(event, error = %e, "logbook append failed");
        }
    }

    fn append(&self, path: &Path, component: &str, event: &str, details: &Value) -> Result<()> {
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            session: &self.session,
            component,
            event,
            details,
        };
        let json = serde_json::to_string(&line)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{}", json)?;
        Ok(())
    }
}

/// First `max` characters of `s` on one line, with an ellipsis when cut.
pub fn preview(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut out: String = flat.chars().take(max).collect();
    out.push('…');
    out
}
