//! services/scrape.rs
//! Drives the external scraper, one profile at a time.
//!
//! - The scraper is `program args.. <identity>`; stdout and stderr are merged
//!   into one line stream ([`ScrapeOutput`]) with tool noise filtered out.
//! - A completion sentinel ends the stream early; the process exit code is
//!   still always collected.
//! - Batches run strictly in order. A non-zero exit marks that identity failed
//!   and the batch moves on.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::json;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ScraperConfig, StorageConfig};
use crate::utils::logbook::Logbook;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("could not start scraper {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scraper for '{identity}' exited with {}", exit_label(.code))]
    ProcessExit { identity: String, code: Option<i32> },
    #[error("'{}' exists and overwrite was declined", .path.display())]
    OverwriteDeclined { path: PathBuf },
    #[error("scraper i/o: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// How the reader pauses between lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldHint {
    Cooperative,
    Sleep(Duration),
}

impl YieldHint {
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            YieldHint::Cooperative
        } else {
            YieldHint::Sleep(Duration::from_millis(ms))
        }
    }

    fn pause(self) {
        match self {
            YieldHint::Cooperative => thread::yield_now(),
            YieldHint::Sleep(d) => thread::sleep(d),
        }
    }
}

/// Merged, filtered output of one scraper run. Finite and not restartable.
pub struct ScrapeOutput {
    child: Child,
    rx: Receiver<String>,
    ignore_patterns: Vec<String>,
    sentinel: String,
    yield_hint: YieldHint,
    saw_sentinel: bool,
    exited: bool,
    done: bool,
}

impl ScrapeOutput {
    pub fn saw_sentinel(&self) -> bool {
        self.saw_sentinel
    }

    pub fn is_noise(&self, line: &str) -> bool {
        self.ignore_patterns
            .iter()
            .any(|p| !p.is_empty() && line.contains(p.as_str()))
    }

    /// Kill the process and end the stream. `finish` still reaps it.
    pub fn cancel(&mut self) -> io::Result<()> {
        self.done = true;
        match self.child.kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait for the process to exit.
    pub fn finish(mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

impl Iterator for ScrapeOutput {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while !self.done {
            match self.rx.recv_timeout(POLL) {
                Ok(line) => {
                    self.yield_hint.pause();
                    if self.is_noise(&line) {
                        continue;
                    }
                    if !self.sentinel.is_empty() && line.contains(self.sentinel.as_str()) {
                        self.saw_sentinel = true;
                        self.done = true;
                    }
                    return Some(line);
                }
                Err(RecvTimeoutError::Disconnected) => self.done = true,
                Err(RecvTimeoutError::Timeout) => {
                    // Descendants may hold the pipes open after the scraper
                    // exits; one quiet poll after exit ends the stream.
                    if self.exited {
                        self.done = true;
                    } else if let Ok(Some(_)) = self.child.try_wait() {
                        self.exited = true;
                    }
                }
            }
        }
        None
    }
}

fn pump<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scraper stream read failed");
                    break;
                }
            }
        }
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeStatus {
    pub identity: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub lines: usize,
    pub saw_sentinel: bool,
}

impl ScrapeStatus {
    pub fn check(&self) -> Result<(), ScrapeError> {
        if self.success {
            Ok(())
        } else {
            Err(ScrapeError::ProcessExit {
                identity: self.identity.clone(),
                code: self.exit_code,
            })
        }
    }
}

#[derive(Debug)]
pub enum ScrapeOutcome {
    Completed(ScrapeStatus),
    Failed(ScrapeError),
}

#[derive(Debug)]
pub struct ReportEntry {
    pub identity: String,
    pub outcome: ScrapeOutcome,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<ReportEntry>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, ScrapeOutcome::Completed(_)))
            .map(|e| e.identity.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, ScrapeOutcome::Failed(_)))
            .map(|e| e.identity.as_str())
    }

    pub fn outcome(&self, identity: &str) -> Option<&ScrapeOutcome> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .map(|e| &e.outcome)
    }
}

pub struct ScrapeDriver {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    ignore_patterns: Vec<String>,
    sentinel: String,
    yield_hint: YieldHint,
    output_path: PathBuf,
    logbook: Logbook,
}

impl ScrapeDriver {
    pub fn from_config(scraper: &ScraperConfig, storage: &StorageConfig) -> Self {
        Self {
            program: scraper.program.clone(),
            args: scraper.args.clone(),
            working_dir: Some(scraper.working_dir.clone()),
            ignore_patterns: scraper.ignore_patterns.clone(),
            sentinel: scraper.finish_sentinel.clone(),
            yield_hint: YieldHint::from_millis(scraper.yield_ms),
            output_path: storage.posts_csv.clone(),
            logbook: Logbook::disabled(),
        }
    }

    pub fn with_logbook(mut self, logbook: Logbook) -> Self {
        self.logbook = logbook;
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Start the scraper for one identity.
    pub fn spawn(&self, identity: &str) -> Result<ScrapeOutput, ScrapeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(identity)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| ScrapeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let (tx, rx) = crossbeam_channel::unbounded();
        if let Some(out) = child.stdout.take() {
            pump(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            pump(err, tx);
        }

        Ok(ScrapeOutput {
            child,
            rx,
            ignore_patterns: self.ignore_patterns.clone(),
            sentinel: self.sentinel.clone(),
            yield_hint: self.yield_hint,
            saw_sentinel: false,
            exited: false,
            done: false,
        })
    }

    /// Run the scraper for `identity`, handing each kept line to `sink`.
    pub fn run_one(
        &self,
        identity: &str,
        sink: &mut dyn FnMut(&str, &str),
    ) -> Result<ScrapeStatus, ScrapeError> {
        let mut output = self.spawn(identity)?;
        let mut lines = 0usize;
        for line in output.by_ref() {
            lines += 1;
            tracing::debug!(identity = %identity, "{line}");
            sink(identity, &line);
        }
        let saw_sentinel = output.saw_sentinel();
        let status = output.finish()?;
        Ok(ScrapeStatus {
            identity: identity.to_string(),
            exit_code: status.code(),
            success: status.success(),
            lines,
            saw_sentinel,
        })
    }

    /// Clear the aggregate output file before a batch. An existing file is only
    /// removed when `confirm` agrees; otherwise nothing is touched.
    pub fn prepare_output(&self, confirm: &mut dyn FnMut(&Path) -> bool) -> Result<(), ScrapeError> {
        if !self.output_path.exists() {
            return Ok(());
        }
        if !confirm(&self.output_path) {
            tracing::info!(path = %self.output_path.display(), "overwrite declined; batch cancelled");
            return Err(ScrapeError::OverwriteDeclined {
                path: self.output_path.clone(),
            });
        }
        std::fs::remove_file(&self.output_path)?;
        tracing::info!(path = %self.output_path.display(), "removed previous results");
        Ok(())
    }

    /// Scrape every identity in order. A scraper that cannot be started at all
    /// aborts the batch; any other per-identity failure is recorded and skipped.
    pub fn run_many<S: AsRef<str>>(
        &self,
        identities: &[S],
        confirm: &mut dyn FnMut(&Path) -> bool,
        sink: &mut dyn FnMut(&str, &str),
    ) -> Result<BatchReport, ScrapeError> {
        self.prepare_output(confirm)?;

        let total = identities.len();
        let mut report = BatchReport::default();
        for (i, identity) in identities.iter().map(AsRef::as_ref).enumerate() {
            tracing::info!(identity = %identity, "processing user {}/{}", i + 1, total);
            self.logbook
                .record("scrape", "scrape_started", json!({ "identity": identity }));

            let outcome = match self.run_one(identity, sink) {
                Ok(status) => match status.check() {
                    Ok(()) => ScrapeOutcome::Completed(status),
                    Err(e) => ScrapeOutcome::Failed(e),
                },
                Err(e @ ScrapeError::Spawn { .. }) => return Err(e),
                Err(e) => ScrapeOutcome::Failed(e),
            };

            match &outcome {
                ScrapeOutcome::Completed(status) => {
                    tracing::info!(identity = %identity, lines = status.lines, "scrape complete");
                    self.logbook.record(
                        "scrape",
                        "scrape_finished",
                        json!({ "identity": identity, "ok": true, "lines": status.lines }),
                    );
                }
                ScrapeOutcome::Failed(e) => {
                    tracing::warn!(identity = %identity, error = %e, "scrape failed");
                    self.logbook.record(
                        "scrape",
                        "scrape_finished",
                        json!({ "identity": identity, "ok": false, "error": e.to_string() }),
                    );
                }
            }
            report.entries.push(ReportEntry {
                identity: identity.to_string(),
                outcome,
            });
        }
        Ok(report)
    }
}
