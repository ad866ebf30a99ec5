mod common;

use common::{canned, classify, Call, ScriptedBackend};
use mimic_core::config::ModelConfig;
use mimic_core::services::blocks::Table;
use mimic_core::services::model::{ModelError, Role};
use mimic_core::services::persona::{
    aggregate_posts, truncate_chars, CsvPersonaStore, ExampleKind, PersonaStore,
    PersonaSynthesizer, SynthesisError, EXAMPLE_PLACEHOLDER, PERSONA_COLUMNS,
};
use tempfile::tempdir;

fn synth<B: mimic_core::services::model::ModelBackend>(backend: B) -> PersonaSynthesizer<B> {
    PersonaSynthesizer::new(backend, &ModelConfig::default())
}

#[test]
fn full_synthesis_uses_persona_for_examples() -> anyhow::Result<()> {
    let backend = ScriptedBackend::new(canned(&[]));
    let s = synth(&backend);
    let record = s.synthesize("alice", "post one\n\n---\n\npost two")?;

    assert_eq!(record.profile_identity, "alice");
    assert_eq!(record.persona_text, "A pragmatic security engineer.");
    assert_eq!(record.social_example, "social post");
    assert_eq!(record.email_example, "email body");
    assert_eq!(record.text_example, "hey, read this");
    assert!(record.failed_examples().is_empty());
    assert!(chrono::DateTime::parse_from_rfc3339(&record.created_at).is_ok());

    let reqs = backend.requests();
    let calls: Vec<Call> = reqs.iter().map(classify).collect();
    assert_eq!(calls, [Call::Persona, Call::Social, Call::Email, Call::Text]);

    let persona_req = &reqs[0];
    assert_eq!(persona_req.model, "gpt-4o");
    assert_eq!(persona_req.temperature, 0.6);
    assert_eq!(persona_req.max_tokens, 1024);
    assert_eq!(persona_req.messages[0].role, Role::System);
    assert!(persona_req.messages[1].content.contains("post two"));

    for (req, (t, max)) in reqs[1..].iter().zip([(0.7, 150), (0.7, 200), (0.8, 100)]) {
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        assert!(req.messages[0].content.contains("A pragmatic security engineer."));
        assert!(!req.messages[0].content.contains("post one"));
        assert_eq!(req.temperature, t);
        assert_eq!(req.max_tokens, max);
    }
    Ok(())
}

#[test]
fn persona_failure_is_generation_failed() {
    let backend = ScriptedBackend::new(canned(&[Call::Persona]));
    let err = synth(&backend).synthesize("bob", "some posts").unwrap_err();
    match err {
        SynthesisError::GenerationFailed { identity, source } => {
            assert_eq!(identity, "bob");
            assert!(matches!(source, ModelError::Status { status: 503, .. }));
        }
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
    // No example requests after the persona failed.
    assert_eq!(backend.requests().len(), 1);
}

#[test]
fn failed_casual_example_becomes_placeholder() -> anyhow::Result<()> {
    let backend = ScriptedBackend::new(canned(&[Call::Text]));
    let record = synth(&backend).synthesize("carol", "posts")?;
    assert_eq!(record.text_example, EXAMPLE_PLACEHOLDER);
    assert_eq!(record.social_example, "social post");
    assert_eq!(record.email_example, "email body");
    assert_eq!(record.failed_examples(), [ExampleKind::Text]);
    Ok(())
}

#[test]
fn every_example_may_fail_independently() -> anyhow::Result<()> {
    let backend = ScriptedBackend::new(canned(&[Call::Social, Call::Email, Call::Text]));
    let record = synth(&backend).synthesize("dave", "posts")?;
    assert_eq!(record.persona_text, "A pragmatic security engineer.");
    assert_eq!(record.failed_examples().len(), 3);
    assert_eq!(backend.requests().len(), 4);
    Ok(())
}

#[test]
fn blank_posts_never_reach_the_backend() {
    let backend = ScriptedBackend::new(canned(&[]));
    let err = synth(&backend).synthesize("erin", " \n\t").unwrap_err();
    assert!(matches!(err, SynthesisError::NoPosts { .. }));
    assert!(backend.requests().is_empty());
}

#[test]
fn posts_are_truncated_to_the_budget() -> anyhow::Result<()> {
    let backend = ScriptedBackend::new(canned(&[]));
    let cfg = ModelConfig {
        persona_char_budget: 10,
        ..ModelConfig::default()
    };
    let s = PersonaSynthesizer::new(&backend, &cfg);
    s.synthesize("frank", "ééééééééééTAIL")?;
    let prompt = &backend.requests()[0].messages[1].content;
    assert!(prompt.ends_with("POSTS:\néééééééééé"));

    assert_eq!(truncate_chars("abc", 10), "abc");
    assert_eq!(truncate_chars("abcdef", 3), "abc");
    Ok(())
}

#[test]
fn aggregate_skips_blank_posts() {
    let mut table = Table::new(vec!["Name".into(), "Post_Content".into()]);
    for post in ["first", "", "  ", "second"] {
        table.rows.push(vec!["x".into(), post.into()]);
    }
    assert_eq!(aggregate_posts(&table, "Post_Content"), "first\n\n---\n\nsecond");
    assert_eq!(aggregate_posts(&table, "Missing"), "");
}

#[test]
fn csv_store_appends_history() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = CsvPersonaStore::new(dir.path().join("LIS").join("personas.csv"));
    assert!(store.load()?.is_empty());

    let backend = ScriptedBackend::new(canned(&[]));
    let s = synth(&backend);
    let first = s.synthesize("alice", "posts")?;
    let mut second = s.synthesize("alice", "more posts")?;
    second.persona_text = "line one\nline two, with comma".into();
    store.append(&first)?;
    store.append(&second)?;

    let text = std::fs::read_to_string(store.path())?;
    assert_eq!(text.lines().next(), Some(PERSONA_COLUMNS.join(",").as_str()));

    let loaded = store.load()?;
    assert_eq!(loaded, [first, second]);
    Ok(())
}
