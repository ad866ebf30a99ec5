#![cfg(unix)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use common::{canned, ScriptedBackend};
use mimic_core::commands::{collect_identities, PersonaSelection, Pipeline, PipelineError};
use mimic_core::config::CoreConfig;
use mimic_core::services::credentials::{CredentialStore, MemoryCredentialStore};
use mimic_core::services::gate::{AuthSession, GateEvent, GateOutcome};
use mimic_core::services::model::{ModelBackend, ModelError, ModelRequest};
use mimic_core::services::persona::{CsvPersonaStore, PersonaStore, SynthesisError, EXAMPLE_PLACEHOLDER};
use mimic_core::services::totp::{unix_now, Totp};
use mimic_core::utils::logbook::Logbook;
use tempfile::{tempdir, TempDir};

const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
const CLIENT: &str = "192.168.1.20";

const SCRAPER: &str = r#"
id="$1"
if [ "$id" = "u2" ]; then echo "profile not found" >&2; exit 1; fi
printf 'linked_in_profile_name=%s\nName,Post_Content\n%s,"%s writes about detection, and tooling"\n%s,second post by %s\n' "$id" "$id" "$id" "$id" "$id" >> LIS/user_posts_extended.csv
echo "[*] Finished"
"#;

fn config(dir: &TempDir) -> CoreConfig {
    let mut cfg = CoreConfig::rooted(dir.path());
    cfg.scraper.program = PathBuf::from("sh");
    cfg.scraper.args = vec!["-c".into(), SCRAPER.into(), "scraper".into()];
    cfg.scraper.require_cookies = false;
    cfg.scraper.converter_program = PathBuf::from("sh");
    cfg.scraper.converter_args = vec![
        "-c".into(),
        "cp LIS/lnkedin_cookies.json LIS/lnkedin_cookies.txt && echo converted".into(),
    ];
    fs::create_dir_all(dir.path().join("LIS")).unwrap();
    cfg
}

fn pipeline<B: ModelBackend>(dir: &TempDir, cfg: CoreConfig, backend: B) -> Pipeline<MemoryCredentialStore, B, CsvPersonaStore> {
    let store = MemoryCredentialStore::new();
    store.append(CLIENT, SECRET).unwrap();
    let personas = CsvPersonaStore::new(dir.path().join("LIS").join("personas.csv"));
    Pipeline::new(cfg, store, backend, personas)
}

fn authed() -> AuthSession {
    AuthSession {
        authenticated: true,
        pending: false,
    }
}

fn yes(_: &Path) -> bool {
    true
}

fn quiet(_: &str, _: &str) {}

#[test]
fn login_through_pipeline() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, config(&dir), &backend);

    let code = Totp::from_base32(SECRET)?.code_at(unix_now());
    let (session, outcome) = p.authenticate(AuthSession::default(), CLIENT, GateEvent::SubmitCode(code))?;
    assert_eq!(outcome, GateOutcome::Authenticated);
    assert!(session.authenticated);
    Ok(())
}

#[test]
fn everything_requires_authentication() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, config(&dir), &backend);
    let anon = AuthSession::default();

    assert!(matches!(p.scrape(&anon, &["u1"], &mut yes, &mut quiet), Err(PipelineError::NotAuthenticated)));
    assert!(matches!(p.generate_persona(&anon, "u1"), Err(PipelineError::NotAuthenticated)));
    assert!(matches!(p.personas(&anon), Err(PipelineError::NotAuthenticated)));
    assert!(matches!(p.configure_cookies(&anon, "[]"), Err(PipelineError::NotAuthenticated)));
    assert!(matches!(
        p.run(&anon, &["u1"], &PersonaSelection::All, &mut yes, &mut quiet),
        Err(PipelineError::NotAuthenticated)
    ));
    assert!(!dir.path().join("LIS").join("user_posts_extended.csv").exists());
    Ok(())
}

#[test]
fn batch_isolates_scrape_failures_and_builds_personas() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let log = dir.path().join("analysis").join("logbook").join("actions.jsonl");
    let p = pipeline(&dir, config(&dir), &backend).with_logbook(Logbook::open(&log));

    let report = p.run(&authed(), &["u1", "u2", "u3"], &PersonaSelection::All, &mut yes, &mut quiet)?;
    assert_eq!(report.scrape.succeeded().collect::<Vec<_>>(), ["u1", "u3"]);
    assert_eq!(report.scrape.failed().collect::<Vec<_>>(), ["u2"]);

    let built: Vec<&str> = report.personas.generated().map(|r| r.profile_identity.as_str()).collect();
    assert_eq!(built, ["u1", "u3"]);
    assert_eq!(report.personas.failures().count(), 0);

    // The persona prompt carries the aggregated posts, separated by a rule.
    let first_prompt = &backend.requests()[0].messages[1].content;
    assert!(first_prompt.contains("u1 writes about detection, and tooling\n\n---\n\nsecond post by u1"));

    let stored = p.personas(&authed())?;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].profile_identity, "u3");

    let events: Vec<String> = fs::read_to_string(&log)?
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v["event"].as_str().map(str::to_string))
        .collect();
    assert_eq!(events.iter().filter(|e| *e == "scrape_started").count(), 3);
    assert_eq!(events.iter().filter(|e| *e == "persona_generated").count(), 2);
    Ok(())
}

#[test]
fn persona_failure_for_one_identity_does_not_block_others() -> anyhow::Result<()> {
    let dir = tempdir()?;
    // Fail the persona request whose posts belong to u1.
    let backend = ScriptedBackend::new(|req: &ModelRequest| {
        if req.messages.iter().any(|m| m.content.contains("second post by u1")) {
            return Err(ModelError::Transport("connection reset".into()));
        }
        canned(&[])(req)
    });
    let p = pipeline(&dir, config(&dir), &backend);
    p.scrape(&authed(), &["u1", "u3"], &mut yes, &mut quiet)?;

    let batch = p.generate_personas(&authed(), &["u1", "missing", "u3"])?;
    let failures: Vec<&str> = batch.failures().map(|(id, _)| id).collect();
    assert_eq!(failures, ["u1", "missing"]);
    assert!(matches!(
        batch.results[0].1,
        Err(PipelineError::Synthesis(SynthesisError::GenerationFailed { .. }))
    ));
    assert!(matches!(batch.results[1].1, Err(PipelineError::UnknownProfile(_))));

    // Only the successful synthesis reached the personas table.
    let stored = CsvPersonaStore::new(dir.path().join("LIS").join("personas.csv")).load()?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].profile_identity, "u3");
    Ok(())
}

#[test]
fn example_failure_still_saves_persona() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[common::Call::Text]));
    let p = pipeline(&dir, config(&dir), &backend);
    p.scrape(&authed(), &["u1"], &mut yes, &mut quiet)?;

    let record = p.generate_persona(&authed(), "u1")?;
    assert_eq!(record.text_example, EXAMPLE_PLACEHOLDER);
    assert_eq!(p.personas(&authed())?, [record]);
    Ok(())
}

#[test]
fn regenerating_appends_history() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, config(&dir), &backend);
    p.scrape(&authed(), &["u1"], &mut yes, &mut quiet)?;

    p.generate_persona(&authed(), "u1")?;
    p.generate_persona(&authed(), "u1")?;
    let stored = p.personas(&authed())?;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.profile_identity == "u1"));
    Ok(())
}

#[test]
fn persona_before_any_scrape_reports_missing_data() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, config(&dir), &backend);
    assert!(matches!(p.generate_persona(&authed(), "u1"), Err(PipelineError::NoScrapedData(_))));
    assert!(p.personas(&authed())?.is_empty());
    assert!(backend.requests().is_empty());
    Ok(())
}

#[test]
fn run_keeps_scrape_report_when_posts_are_unavailable() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut cfg = config(&dir);
    cfg.scraper.args = vec!["-c".into(), "echo blocked >&2; exit 1".into(), "scraper".into()];
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, cfg, &backend);

    let only_u1 = PersonaSelection::Only(vec!["u1".into()]);
    let report = p.run(&authed(), &["u1", "u2"], &only_u1, &mut yes, &mut quiet)?;
    assert_eq!(report.scrape.failed().collect::<Vec<_>>(), ["u1", "u2"]);
    assert_eq!(report.personas.results.len(), 1);
    assert_eq!(report.personas.results[0].0, "u1");
    assert!(matches!(report.personas.results[0].1, Err(PipelineError::NoScrapedData(_))));
    assert!(backend.requests().is_empty());
    Ok(())
}

#[test]
fn run_reports_unparseable_posts_per_identity() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut cfg = config(&dir);
    let broken = r#"printf 'linked_in_profile_name=%s\nName,Post_Content\n%s,"never closed\n' "$1" "$1" >> LIS/user_posts_extended.csv"#;
    cfg.scraper.args = vec!["-c".into(), broken.into(), "scraper".into()];
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, cfg, &backend);

    let report = p.run(&authed(), &["u1", "u3"], &PersonaSelection::All, &mut yes, &mut quiet)?;
    assert_eq!(report.scrape.succeeded().collect::<Vec<_>>(), ["u1", "u3"]);
    let failures: Vec<&str> = report.personas.failures().map(|(id, _)| id).collect();
    assert_eq!(failures, ["u1", "u3"]);
    assert!(report
        .personas
        .failures()
        .all(|(_, e)| matches!(e, PipelineError::ScrapedDataUnreadable(_))));
    assert!(p.personas(&authed())?.is_empty());
    Ok(())
}

#[test]
fn scraping_requires_cookies_when_configured() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut cfg = config(&dir);
    cfg.scraper.require_cookies = true;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, cfg, &backend);

    let err = p.scrape(&authed(), &["u1"], &mut yes, &mut quiet).unwrap_err();
    assert!(matches!(err, PipelineError::CookiesMissing(_)));

    let report = p.configure_cookies(&authed(), r#"[{"name":"li_at","value":"abc"}]"#)?;
    assert!(report.txt_path.exists());
    assert!(report.converter_output.contains("converted"));
    let saved = fs::read_to_string(&report.json_path)?;
    assert!(saved.contains("\n"), "cookie JSON is pretty-printed");
    assert!(saved.contains("\"li_at\""));

    let batch = p.scrape(&authed(), &["u1"], &mut yes, &mut quiet)?;
    assert_eq!(batch.succeeded().count(), 1);
    Ok(())
}

#[test]
fn cookie_setup_rejects_bad_input_and_failed_conversion() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let backend = ScriptedBackend::new(canned(&[]));
    let p = pipeline(&dir, config(&dir), &backend);

    assert!(matches!(p.configure_cookies(&authed(), "  "), Err(PipelineError::Cookies(_))));
    assert!(matches!(p.configure_cookies(&authed(), "{not json"), Err(PipelineError::Cookies(_))));

    let mut cfg = config(&dir);
    cfg.scraper.converter_args = vec!["-c".into(), "echo conversion broke >&2; exit 2".into()];
    let p = pipeline(&dir, cfg, &backend);
    match p.configure_cookies(&authed(), "[]") {
        Err(PipelineError::Cookies(msg)) => assert!(msg.contains("conversion broke")),
        other => panic!("expected cookie failure, got {other:?}"),
    }

    // Exit 0 without producing the cookie file is still a failure.
    let mut cfg = config(&dir);
    cfg.scraper.converter_args = vec!["-c".into(), "true".into()];
    let p = pipeline(&dir, cfg, &backend);
    assert!(matches!(p.configure_cookies(&authed(), "[]"), Err(PipelineError::Cookies(_))));
    Ok(())
}

#[test]
fn collect_identities_from_file_or_single_value() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let list = dir.path().join("users.txt");
    fs::write(&list, "alice\n\n  bob  \ncarol\n")?;
    assert_eq!(collect_identities(list.to_str().unwrap())?, ["alice", "bob", "carol"]);

    assert_eq!(collect_identities("  dave ")?, ["dave"]);

    let empty = dir.path().join("empty.txt");
    fs::write(&empty, "\n \n")?;
    assert!(matches!(collect_identities(empty.to_str().unwrap()), Err(PipelineError::NoIdentities)));
    assert!(matches!(collect_identities(""), Err(PipelineError::NoIdentities)));
    Ok(())
}
