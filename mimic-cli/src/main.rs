use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use qrcode::render::unicode;
use qrcode::QrCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mimic_core::config::load_dotenv;
use mimic_core::commands::{
    collect_identities, default_root, ensure_initialized, PersonaSelection, Pipeline,
    PipelineError, RunReport,
};
use mimic_core::services::gate::{AuthError, AuthSession, AuthState, GateEvent, GateOutcome};
use mimic_core::services::persona::{PersonaRecord, PersonaStore};
use mimic_core::services::scrape::ScrapeOutcome;
use mimic_core::services::{CredentialStore, ModelBackend};
use mimic_core::utils::identity::resolve_client_identity;
use mimic_core::utils::logbook::preview;

#[derive(Parser)]
#[command(
    name = "mimic",
    about = "TOTP-gated profile scraping and persona synthesis"
)]
struct Cli {
    /// Data root (defaults to $MIMIC_ROOT or the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Client identity override (defaults to this host's address)
    #[arg(long, global = true)]
    identity: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Register a new TOTP secret for this client and print the provisioning URI
    Enroll,
    /// Log in and work through the interactive menu
    Session,
    /// Log in, scrape every identity in INPUT, then optionally build personas
    Batch {
        #[arg(long)]
        code: String,
        /// A profile identity, or a file with one identity per line
        #[arg(long)]
        input: String,
        /// Replace existing scrape results without asking
        #[arg(long)]
        yes: bool,
        /// `all`, or the identities to build personas for
        #[arg(long, num_args = 1..)]
        persona: Vec<String>,
    },
    /// List saved personas
    Personas {
        #[arg(long)]
        code: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root.clone().unwrap_or_else(default_root);

    let dotenv = load_dotenv(&root)?;
    let report = ensure_initialized(&root)?;
    let log_path = init_logging(&report.config.logbook.logs_dir)?;
    tracing::info!(root = %root.display(), log = %log_path.display(), "mimic starting");
    if let Some(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded environment file");
    }

    let pipeline = Pipeline::open(&root)?;
    let identity = resolve_client_identity(cli.identity.as_deref());
    tracing::debug!(identity = %identity, "resolved client identity");

    match cli.cmd {
        Cmd::Enroll => enroll(&pipeline, &identity),
        Cmd::Session => session(&pipeline, &identity),
        Cmd::Batch {
            code,
            input,
            yes,
            persona,
        } => batch(&pipeline, &identity, &code, &input, yes, &persona),
        Cmd::Personas { code } => {
            let session = login(&pipeline, &identity, &code)?;
            view_personas(&pipeline, &session)
        }
    }
}

/// stderr text layer plus a per-session log file. Returns the file path.
fn init_logging(logs_dir: &Path) -> Result<PathBuf> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fs::create_dir_all(logs_dir).with_context(|| format!("mkdir -p {logs_dir:?}"))?;
    let path = logs_dir.join(format!("session_{}.log", Local::now().format("%Y%m%d_%H%M%S")));
    let file = File::create(&path).with_context(|| format!("create log file {path:?}"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .init();
    Ok(path)
}

// ---------- auth ----------

fn enroll<S, B, P>(pipeline: &Pipeline<S, B, P>, identity: &str) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    match pipeline.authenticate(AuthSession::default(), identity, GateEvent::Enroll) {
        Ok((_, GateOutcome::Enrolled(e))) => {
            print_enrollment(&e.identity, &e.secret, &e.uri);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(PipelineError::Auth(e @ AuthError::AlreadyEnrolled { .. })) => {
            println!("{e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_enrollment(identity: &str, secret: &str, uri: &str) {
    println!("Enrolled {identity}.");
    println!("Scan this code with your authenticator app, or enter the secret by hand:");
    println!();
    match render_qr(uri) {
        Ok(qr) => println!("{qr}"),
        Err(e) => tracing::warn!(error = %e, "could not render provisioning QR code"),
    }
    println!("  {uri}");
    println!();
    println!("  secret: {secret}");
}

/// Provisioning URI as a terminal QR code, two modules per character cell.
fn render_qr(uri: &str) -> Result<String> {
    let code = QrCode::new(uri.as_bytes()).context("encode provisioning URI")?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

fn login<S, B, P>(pipeline: &Pipeline<S, B, P>, identity: &str, code: &str) -> Result<AuthSession>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let (session, _) = pipeline
        .authenticate(AuthSession::default(), identity, GateEvent::SubmitCode(code.to_string()))
        .context("login")?;
    Ok(session)
}

/// Loop until the client authenticates or stdin closes.
fn interactive_login<S, B, P>(pipeline: &Pipeline<S, B, P>, identity: &str) -> Result<Option<AuthSession>>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let mut session = AuthSession::default();
    println!("Client identity: {identity}");
    loop {
        let event = match pipeline.auth_state(&session, identity)? {
            AuthState::Authenticated => return Ok(Some(session)),
            AuthState::Unregistered => {
                println!("  [1] I need a code");
                println!("  [2] I already have a code");
                match prompt("Choose: ")?.as_deref() {
                    None => return Ok(None),
                    Some("1") => GateEvent::Enroll,
                    Some("2") => GateEvent::HaveCode,
                    Some(_) => continue,
                }
            }
            AuthState::Registered | AuthState::AwaitingCode => {
                match prompt("Enter your 6-digit code: ")? {
                    None => return Ok(None),
                    Some(code) => GateEvent::SubmitCode(code),
                }
            }
        };
        match pipeline.authenticate(session, identity, event) {
            Ok((next, outcome)) => {
                session = next;
                match outcome {
                    GateOutcome::Enrolled(e) => print_enrollment(&e.identity, &e.secret, &e.uri),
                    GateOutcome::Authenticated => println!("Authenticated."),
                    GateOutcome::Pending | GateOutcome::AlreadyAuthenticated => {}
                }
            }
            Err(PipelineError::Auth(e)) if e.is_retryable() => println!("{e}"),
            Err(PipelineError::Auth(e @ AuthError::NoCredential { .. })) => {
                println!("{e}");
                session = AuthSession::default();
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------- interactive session ----------

fn session<S, B, P>(pipeline: &Pipeline<S, B, P>, identity: &str) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let Some(session) = interactive_login(pipeline, identity)? else {
        return Ok(());
    };

    loop {
        println!();
        println!("  [1] Configure cookies");
        println!("  [2] Scrape profiles");
        println!("  [3] Generate persona");
        println!("  [4] View personas");
        println!("  [5] Exit");
        let Some(choice) = prompt("Choose: ")? else {
            return Ok(());
        };
        let result = match choice.as_str() {
            "1" => configure_cookies(pipeline, &session),
            "2" => scrape(pipeline, &session),
            "3" => generate_persona(pipeline, &session),
            "4" => view_personas(pipeline, &session),
            "5" => return Ok(()),
            _ => continue,
        };
        if let Err(e) = result {
            tracing::error!(error = %format!("{e:#}"), "operation failed");
            println!("[!] {e:#}");
        }
    }
}

fn configure_cookies<S, B, P>(pipeline: &Pipeline<S, B, P>, session: &AuthSession) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    println!("Paste the cookie JSON export (finish with an empty line), or give a path to it.");
    let mut text = String::new();
    while let Some(line) = prompt("")? {
        if line.is_empty() {
            break;
        }
        if text.is_empty() && Path::new(&line).is_file() {
            text = fs::read_to_string(&line).with_context(|| format!("read {line}"))?;
            break;
        }
        text.push_str(&line);
        text.push('\n');
    }
    let report = pipeline.configure_cookies(session, &text)?;
    println!("Cookies saved to {}", report.txt_path.display());
    Ok(())
}

fn scrape<S, B, P>(pipeline: &Pipeline<S, B, P>, session: &AuthSession) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let Some(input) = prompt("Profile identity, or a file with one per line: ")? else {
        return Ok(());
    };
    let identities = collect_identities(&input)?;
    let report = pipeline.scrape(session, identities.as_slice(), &mut confirm_overwrite, &mut print_line)?;
    print_scrape_report(&report.entries.iter().map(|e| (&e.identity, &e.outcome)).collect::<Vec<_>>());
    Ok(())
}

fn generate_persona<S, B, P>(pipeline: &Pipeline<S, B, P>, session: &AuthSession) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let profiles = pipeline.profiles()?;
    let ids: Vec<&str> = profiles.identities().collect();
    if ids.is_empty() {
        println!("No users found in the scraped data.");
        return Ok(());
    }
    for (i, id) in ids.iter().enumerate() {
        println!("  [{}] {id}", i + 1);
    }
    let Some(choice) = prompt(&format!("Select a user (1-{}): ", ids.len()))? else {
        return Ok(());
    };
    let Some(identity) = choice
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| ids.get(i))
    else {
        println!("Invalid selection.");
        return Ok(());
    };
    println!("Generating persona for '{identity}'...");
    let record = pipeline.generate_persona(session, identity)?;
    print_persona(&record);
    Ok(())
}

fn view_personas<S, B, P>(pipeline: &Pipeline<S, B, P>, session: &AuthSession) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let records = pipeline.personas(session)?;
    if records.is_empty() {
        println!("No personas saved yet.");
        return Ok(());
    }
    println!("{:<24} | {:<71} | {:<51} | created_at", "profile", "persona", "social example");
    for r in &records {
        println!(
            "{:<24} | {:<71} | {:<51} | {}",
            r.profile_identity,
            preview(&r.persona_text, 70),
            preview(&r.social_example, 50),
            r.created_at
        );
    }
    println!();
    println!("Text is truncated for display. Full content is in the CSV file.");
    Ok(())
}

// ---------- batch ----------

fn batch<S, B, P>(
    pipeline: &Pipeline<S, B, P>,
    identity: &str,
    code: &str,
    input: &str,
    yes: bool,
    persona: &[String],
) -> Result<()>
where
    S: CredentialStore,
    B: ModelBackend,
    P: PersonaStore,
{
    let session = login(pipeline, identity, code)?;
    let identities = collect_identities(input)?;
    let selection = match persona {
        [] => PersonaSelection::None,
        [one] if one == "all" => PersonaSelection::All,
        ids => PersonaSelection::Only(ids.to_vec()),
    };

    let mut confirm = |path: &Path| {
        if yes {
            true
        } else {
            confirm_overwrite(path)
        }
    };
    let report = pipeline.run(&session, identities.as_slice(), &selection, &mut confirm, &mut print_line)?;
    print_run_report(&report);

    let failed = report.scrape.failed().count() + report.personas.failures().count();
    anyhow::ensure!(failed == 0, "{failed} step(s) failed");
    Ok(())
}

// ---------- output ----------

fn print_line(identity: &str, line: &str) {
    println!("  [{identity}] {line}");
}

fn confirm_overwrite(path: &Path) -> bool {
    let question = format!("'{}' exists. Delete it and start fresh? (y/n): ", path.display());
    matches!(prompt(&question), Ok(Some(a)) if a.eq_ignore_ascii_case("y"))
}

fn print_scrape_report(entries: &[(&String, &ScrapeOutcome)]) {
    println!();
    for (identity, outcome) in entries {
        match outcome {
            ScrapeOutcome::Completed(s) => println!("[+] {identity}: {} lines", s.lines),
            ScrapeOutcome::Failed(e) => println!("[!] {identity}: {e}"),
        }
    }
}

fn print_run_report(report: &RunReport) {
    print_scrape_report(
        &report
            .scrape
            .entries
            .iter()
            .map(|e| (&e.identity, &e.outcome))
            .collect::<Vec<_>>(),
    );
    for record in report.personas.generated() {
        print_persona(record);
    }
    for (identity, e) in report.personas.failures() {
        println!("[!] persona for {identity}: {e}");
    }
}

fn print_persona(r: &PersonaRecord) {
    println!();
    println!("--- PROFESSIONAL PERSONA: {} ---", r.profile_identity);
    println!("{}", r.persona_text);
    println!();
    println!("[ Social post example ]");
    println!("{}", r.social_example);
    println!();
    println!("[ Professional email example ]");
    println!("{}", r.email_example);
    println!();
    println!("[ Casual text example ]");
    println!("{}", r.text_example);
}

/// Print `msg` and read one trimmed line. `None` on end of input.
fn prompt(msg: &str) -> io::Result<Option<String>> {
    if !msg.is_empty() {
        print!("{msg}");
        io::stdout().flush()?;
    }
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
