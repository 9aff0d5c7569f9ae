//! Integration tests for the controller's ownership of pipelines and engines
//!
//! Tests cover:
//! - Supersession and the one-active-pipeline rule
//! - Start order across repeated back-to-back submissions
//! - Degraded mode when an engine cannot be built
//! - Grounding and wiki fallbacks
//! - Retry of transient stream failures
//! - Context warming, a slow backend load and the parked query slot

use super::test_utils::*;
use gamewiki::events::AssistantEvent;
use gamewiki::intent::IntentType;
use gamewiki::{ApiError, EngineKey, PipelineId, PipelineState, SearchMode, StateTransition};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn guide_source(factory: ScriptedFactory) -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new(factory)
            .with_classifier(ScriptedClassifier::replying(IntentType::Guide, "rewritten question")),
    )
}

fn notices(events: &[AssistantEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            AssistantEvent::Notice { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn drain_transitions(
    rx: &mut tokio::sync::broadcast::Receiver<StateTransition>,
) -> Vec<StateTransition> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(t) => out.push(t),
            Err(TryRecvError::Lagged(n)) => panic!("lost {} transitions", n),
            Err(_) => return out,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_submission_supersedes_running_pipeline() {
    let script = EngineScript::answering(&["a", "b", "c", "d"]).with_delay(Duration::from_millis(30));
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);
    let mut transitions = controller.subscribe_transitions();

    let first = controller.submit_query("first", Some(elden_ring()), SearchMode::Ai);
    let second = controller.submit_query("second", Some(elden_ring()), SearchMode::Ai);
    let third = controller.submit_query("third", Some(elden_ring()), SearchMode::Ai);

    let events = events_until_terminal(&mut rx, third).await;
    assert_eq!(chunk_texts(&events), vec!["a", "b", "c", "d"]);
    controller.wait_idle().await;
    // superseded pipelines never reach the receiver
    assert!(drain(&mut rx).is_empty());

    let log = drain_transitions(&mut transitions);
    let mut running: Option<PipelineId> = None;
    let mut finished = HashSet::new();
    for t in &log {
        if t.to.is_terminal() {
            if running == Some(t.pipeline) {
                running = None;
            }
            finished.insert(t.pipeline);
            continue;
        }
        if t.from == PipelineState::Created {
            assert!(running.is_none(), "{} started while {:?} was active", t.pipeline, running);
            running = Some(t.pipeline);
        }
    }
    assert!(finished.contains(&first));
    assert!(finished.contains(&second));
    assert!(finished.contains(&third));

    let terminal_of = |id: PipelineId| log.iter().find(|t| t.pipeline == id && t.to.is_terminal()).map(|t| t.to);
    assert_eq!(terminal_of(first), Some(PipelineState::Cancelled));
    assert_eq!(terminal_of(second), Some(PipelineState::Cancelled));
    assert_eq!(terminal_of(third), Some(PipelineState::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_superseded_pipeline_settles_before_successor_generates() {
    let source = guide_source(
        ScriptedFactory::new().with_engine("eldenring", EngineScript::answering(&["ok"])),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);
    let mut transitions = controller.subscribe_transitions();

    for round in 0..200 {
        let first = controller.submit_query("first", Some(elden_ring()), SearchMode::Ai);
        let second = controller.submit_query("second", Some(elden_ring()), SearchMode::Ai);

        let events = events_until_terminal(&mut rx, second).await;
        assert_eq!(chunk_texts(&events), vec!["ok"]);
        controller.wait_idle().await;

        let log = drain_transitions(&mut transitions);
        let first_done = log
            .iter()
            .position(|t| t.pipeline == first && t.to.is_terminal())
            .unwrap_or_else(|| panic!("round {}: {} never settled", round, first));
        let second_generating = log
            .iter()
            .position(|t| t.pipeline == second && t.to == PipelineState::Generating)
            .unwrap_or_else(|| panic!("round {}: {} never generated", round, second));
        assert_eq!(log[first_done].to, PipelineState::Cancelled);
        assert!(
            first_done < second_generating,
            "round {}: {} generated before {} was cancelled",
            round,
            second,
            first
        );
    }
    assert_eq!(source.factory.builds(), 1);
    // nothing from a superseded pipeline leaked through
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_failure_degrades_to_wiki() {
    let source = guide_source(
        ScriptedFactory::new().with_failure("eldenring", ApiError::ProviderUnavailable("503".into())),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    let notices = notices(&events);
    assert!(notices.iter().any(|n| n.contains("unavailable")));
    assert!(error_message(&events).is_none());
    let url = wiki_url(&events).expect("wiki fallback");
    assert!(url.ends_with("rewritten+question"));
    controller.wait_idle().await;
    assert_eq!(controller.active_state(), Some((id, PipelineState::Completed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_answer_tries_grounding_first() {
    let source = Arc::new(
        ScriptedSource::new(ScriptedFactory::new().with_engine("eldenring", EngineScript::empty()))
            .with_classifier(ScriptedClassifier::replying(IntentType::Guide, "tier list"))
            .with_grounding(ScriptedGrounding::answering(&["From the web: ", "Rivers of Blood"])),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(chunk_texts(&events), vec!["From the web: ", "Rivers of Blood"]);
    assert_eq!(events.last(), Some(&AssistantEvent::StreamFinished));
    assert!(wiki_url(&events).is_none());
    assert_eq!(source.grounding.as_ref().unwrap().calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_game_without_engine_uses_wiki_with_rewritten_query() {
    let source = guide_source(ScriptedFactory::new());
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("best charms", Some(hollow_knight()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    let url = wiki_url(&events).unwrap();
    assert!(url.contains("site%3Ahollowknight.wiki.gg"));
    assert!(url.ends_with("rewritten+question"));
    assert_eq!(source.factory.builds(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_open_failure_is_retried() {
    let script = EngineScript {
        open_failures: vec![ApiError::ProviderTimeout("read timed out".into())],
        ..EngineScript::answering(&["second try"])
    };
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(chunk_texts(&events), vec!["second try"]);
    let engine = source.factory.engine("eldenring").unwrap();
    assert_eq!(engine.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_before_output_falls_back_to_wiki() {
    let script = EngineScript {
        chunks: vec![Err(ApiError::ProviderError("malformed response".into()))],
        ..EngineScript::default()
    };
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert!(error_message(&events).is_none());
    assert!(wiki_url(&events).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_after_output_keeps_partial_answer() {
    let script = EngineScript {
        chunks: vec![
            Ok("Malenia is weak to ".to_string()),
            Err(ApiError::ProviderError("connection reset".into())),
        ],
        ..EngineScript::default()
    };
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("malenia weakness", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(chunk_texts(&events), vec!["Malenia is weak to "]);
    let message = error_message(&events).unwrap();
    assert!(message.contains("connection reset"));
    assert!(wiki_url(&events).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parked_query_is_replaced_by_newer_submission() {
    let source = guide_source(
        ScriptedFactory::new()
            .with_engine("eldenring", EngineScript::answering(&["done"]))
            .with_build_delay("eldenring", Duration::from_millis(500)),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let first = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Ai);
    wait_for_parked(&controller, first).await;

    let second = controller.submit_query("malenia weakness", Some(elden_ring()), SearchMode::Ai);
    let parked = wait_for_parked(&controller, second).await;
    assert_eq!(parked.query, "malenia weakness");
    assert_eq!(parked.engine_key, EngineKey::new("eldenring"));

    let events = events_until_terminal(&mut rx, second).await;
    assert_eq!(chunk_texts(&events), vec!["done"]);
    assert!(controller.pending_query().is_none());
    // one construction served both submissions
    assert_eq!(source.factory.builds(), 1);
}

async fn wait_for_parked(
    controller: &gamewiki::Controller,
    id: PipelineId,
) -> gamewiki::pipeline::PendingQuery {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(parked) = controller.pending_query() {
                if parked.pipeline == id {
                    return parked;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("query was never parked")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observe_context_warms_engine() {
    let source = guide_source(
        ScriptedFactory::new()
            .with_engine("eldenring", EngineScript::answering(&["warm"]))
            .with_build_delay("eldenring", Duration::from_millis(50)),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    assert_eq!(controller.observe_context("GameWiki Assistant"), None);
    assert_eq!(controller.observe_context("Hollow Knight"), None);
    assert_eq!(controller.observe_context("Untitled - Notepad"), None);
    assert_eq!(
        controller.observe_context("ELDEN RING™"),
        Some(EngineKey::new("eldenring"))
    );

    let key = EngineKey::new("eldenring");
    let engine = tokio::task::block_in_place(|| controller.engine_blocking(&key)).unwrap();
    assert_eq!(engine.key(), &key);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Ai);
    let events = events_until_terminal(&mut rx, id).await;
    // engine was already warm, so no waiting notice
    assert!(notices(&events).is_empty());
    assert_eq!(chunk_texts(&events), vec!["warm"]);
    assert_eq!(source.factory.builds(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_backend_load_is_shared_by_warmup_and_query() {
    let source = Arc::new(
        ScriptedSource::new(
            ScriptedFactory::new().with_engine("eldenring", EngineScript::answering(&["loaded"])),
        )
        .with_classifier(ScriptedClassifier::replying(IntentType::Guide, "tier list"))
        .with_load_delay(Duration::from_millis(200)),
    );
    let (controller, mut rx) = controller_with(&test_config(), &source);

    controller.preload();
    assert_eq!(
        controller.observe_context(ELDEN_RING),
        Some(EngineKey::new("eldenring"))
    );
    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Auto);
    let events = events_until_terminal(&mut rx, id).await;

    assert_eq!(chunk_texts(&events), vec!["loaded"]);
    assert_eq!(source.loads(), 1);
    assert_eq!(source.classifier_calls(), 1);
    assert_eq!(source.factory.builds(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_and_releases_engine() {
    let script = EngineScript::answering(&["a", "b", "c"]).with_delay(Duration::from_millis(100));
    let source = guide_source(ScriptedFactory::new().with_engine("eldenring", script));
    let (controller, mut rx) = controller_with(&test_config(), &source);

    let id = controller.submit_query("tier list", Some(elden_ring()), SearchMode::Ai);
    loop {
        let envelope = rx.recv().await.expect("event");
        if matches!(envelope.event, AssistantEvent::StreamChunk { .. }) {
            break;
        }
    }
    controller.shutdown().await;

    assert_eq!(controller.active_state(), Some((id, PipelineState::Cancelled)));
    assert_eq!(controller.registry().current_key(), None);
    assert!(drain(&mut rx).is_empty());
}
