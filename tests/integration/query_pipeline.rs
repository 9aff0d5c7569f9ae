//! Integration tests for query pipelines driven through the controller
//!
//! Tests cover:
//! - Unsupported contexts fail fast without backend calls
//! - Guide answers waiting on a cold engine
//! - Empty and failing streams falling back to wiki search
//! - Rate limits surfaced without fallback
//! - Cancellation and supersession

use super::test_utils::*;
use gamewiki::events::AssistantEvent;
use gamewiki::fallback::RATE_LIMIT_MESSAGE;
use gamewiki::intent::IntentType;
use gamewiki::{ApiError, GameContext, PipelineState, SearchMode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn guide_source(factory: ScriptedFactory) -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new(factory)
            .with_classifier(ScriptedClassifier::replying(IntentType::Guide, "weapon tier list")),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_context_fails_without_backend_calls() {
    let source = guide_source(ScriptedFactory::new());
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query(
        "best loadout",
        Some(GameContext::new("Untitled - Notepad")),
        SearchMode::Auto,
    );
    let events = events_until_terminal(&mut rx, id).await;

    let message = error_message(&events).expect("error event");
    assert!(message.to_lowercase().contains("unsupported context"));
    assert!(wiki_url(&events).is_none());
    assert_eq!(source.loads(), 0);
    assert_eq!(source.classifier_calls(), 0);
    assert_eq!(source.factory.builds(), 0);

    controller.wait_idle().await;
    assert_eq!(controller.active_state(), Some((id, PipelineState::Failed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guide_query_waits_for_cold_engine() {
    let source = guide_source(
        ScriptedFactory::new()
            .with_engine("eldenring", EngineScript::answering(&["S tier: ", "Rivers of Blood"]))
            .with_build_delay("eldenring", Duration::from_millis(150)),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("weapon tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert!(matches!(
        events.first(),
        Some(AssistantEvent::IntentDetected { intent }) if intent.intent_type == IntentType::Guide
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, AssistantEvent::Notice { .. })));
    assert_eq!(chunk_texts(&events), vec!["S tier: ", "Rivers of Blood"]);
    assert_eq!(events.last(), Some(&AssistantEvent::StreamFinished));
    assert_eq!(source.factory.builds(), 1);

    // the engine received the rewritten query
    let engine = source.factory.engine("eldenring").unwrap();
    assert_eq!(engine.last_query.lock().as_deref(), Some("weapon tier list"));
    // the parked query is cleared once the engine is ready
    assert!(controller.pending_query().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_stream_falls_back_to_wiki() {
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", EngineScript::empty()));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("weapon tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert!(chunk_texts(&events).is_empty());
    assert!(error_message(&events).is_none());
    let url = wiki_url(&events).expect("wiki fallback");
    assert!(url.contains(ELDEN_WIKI_DOMAIN));
    // fallback uses the rewritten query
    assert!(url.ends_with("weapon+tier+list"));
    controller.wait_idle().await;
    assert_eq!(controller.active_state(), Some((id, PipelineState::Completed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_classifier_rate_limit_is_surfaced_without_fallback() {
    let source = Arc::new(
        ScriptedSource::new(ScriptedFactory::new().with_engine("eldenring", EngineScript::answering(&["x"])))
            .with_classifier(ScriptedClassifier::failing(ApiError::ProviderRateLimit("429".into()))),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("weapon tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(error_message(&events).as_deref(), Some(RATE_LIMIT_MESSAGE));
    assert!(wiki_url(&events).is_none());
    controller.wait_idle().await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(source.factory.builds(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_rate_limit_is_surfaced_without_fallback() {
    let script = EngineScript {
        chunks: vec![Err(ApiError::ProviderError("API_RATE_LIMIT: quota exhausted".into()))],
        ..EngineScript::default()
    };
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("weapon tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(error_message(&events).as_deref(), Some(RATE_LIMIT_MESSAGE));
    assert!(wiki_url(&events).is_none());
    let engine = source.factory.engine("eldenring").unwrap();
    assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_three_chunks() {
    let script = EngineScript::answering(&["one ", "two ", "three ", "four ", "five"])
        .with_delay(Duration::from_millis(40));
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("weapon tier list", Some(elden_ring()), SearchMode::Auto);

    let mut chunks = 0;
    while chunks < 3 {
        let envelope = rx.recv().await.expect("event");
        assert_eq!(envelope.pipeline, id);
        if matches!(envelope.event, AssistantEvent::StreamChunk { .. }) {
            chunks += 1;
        }
    }
    controller.cancel_current();
    controller.wait_idle().await;

    assert_eq!(controller.active_state(), Some((id, PipelineState::Cancelled)));
    // nothing further is delivered, not even what was already queued
    assert!(drain(&mut rx).is_empty());
    let engine = source.factory.engine("eldenring").unwrap();
    assert!(engine.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wiki_intent_uses_original_query() {
    let source = Arc::new(
        ScriptedSource::new(ScriptedFactory::new())
            .with_classifier(ScriptedClassifier::replying(IntentType::Wiki, "moonveil katana stats")),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("moonveil", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    let url = wiki_url(&events).unwrap();
    assert_eq!(
        url,
        format!("https://duckduckgo.com/?q=!ducky+site%3A{}+moonveil", ELDEN_WIKI_DOMAIN)
    );
    assert!(events.iter().any(|e| matches!(
        e,
        AssistantEvent::WikiResult { title, .. } if title == "Search: moonveil"
    )));
    assert_eq!(source.factory.builds(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mode_override_skips_classifier() {
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", EngineScript::answering(&["ok"])));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("how to beat malenia", Some(elden_ring()), SearchMode::Wiki);
    let events = events_until_terminal(&mut rx, id).await;
    assert!(wiki_url(&events).is_some());

    let id = controller.submit_query("moonveil", Some(elden_ring()), SearchMode::Ai);
    let events = events_until_terminal(&mut rx, id).await;
    assert_eq!(chunk_texts(&events), vec!["ok"]);

    assert_eq!(source.classifier_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_classifier_failure_uses_heuristic() {
    let source = Arc::new(
        ScriptedSource::new(ScriptedFactory::new())
            .with_classifier(ScriptedClassifier::failing(ApiError::ProviderUnavailable("down".into()))),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("what is moonveil", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    match events.first() {
        Some(AssistantEvent::IntentDetected { intent }) => {
            assert_eq!(intent.intent_type, IntentType::Wiki);
            assert_eq!(intent.confidence, 0.7);
        }
        other => panic!("unexpected first event: {:?}", other),
    }
    assert!(wiki_url(&events).is_some());
    assert_eq!(source.classifier_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_classifier_times_out_to_heuristic() {
    let source = Arc::new(
        ScriptedSource::new(ScriptedFactory::new()).with_classifier(
            ScriptedClassifier::replying(IntentType::Guide, "unused").with_delay(Duration::from_secs(5)),
        ),
    );
    let mut config = test_config();
    config.query.classification_timeout_ms = 50;
    let (controller, mut rx) = controller_with(&config, &source);

    let id = controller.submit_query("moonveil wiki info", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;
    assert!(wiki_url(&events).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_context_uses_heuristic_without_backend() {
    let source = guide_source(ScriptedFactory::new());
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("what is moonveil", None, SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;
    assert!(wiki_url(&events).unwrap().ends_with("what+is+moonveil+wiki"));

    // the assistant's own window counts as no context
    let id = controller.submit_query(
        "what is moonveil",
        Some(GameContext::new("GameWiki Assistant")),
        SearchMode::Auto,
    );
    let events = events_until_terminal(&mut rx, id).await;
    assert!(wiki_url(&events).is_some());
    assert_eq!(source.classifier_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_query_is_rejected() {
    let source = guide_source(ScriptedFactory::new());
    let (controller, mut rx) = controller_with(&test_config(), &source);
    let id = controller.submit_query("   ", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;
    assert!(error_message(&events).is_some());
    assert_eq!(source.classifier_calls(), 0);
}
