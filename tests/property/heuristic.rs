//! Property-based tests for the keyword heuristic

use gamewiki::intent::{heuristic_intent, IntentType, HEURISTIC_CONFIDENCE};
use gamewiki::PipelineId;
use proptest::prelude::*;

/// The heuristic always answers with fixed confidence and passes the query
/// through unchanged
#[test]
fn test_heuristic_is_total_and_passthrough() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<String>(), |query| {
            let intent = heuristic_intent(&query);
            prop_assert_eq!(intent.confidence, HEURISTIC_CONFIDENCE);
            prop_assert_eq!(&intent.rewritten_query, &query);
            prop_assert_eq!(&intent.translated_query, &query);
            prop_assert!(intent.intent_type != IntentType::Unsupported);
            Ok(())
        })
        .unwrap();
}

/// Queries without any keyword default to guide
#[test]
fn test_keyword_free_queries_are_guides() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&"[x-z0-9 ]{0,40}", |query| {
            prop_assert_eq!(heuristic_intent(&query).intent_type, IntentType::Guide);
            Ok(())
        })
        .unwrap();
}

/// A single wiki keyword outweighs no guide keyword, whatever surrounds it
#[test]
fn test_wiki_keyword_wins_alone() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&("[x-z ]{0,20}", "[x-z ]{0,20}"), |(before, after)| {
            let query = format!("{}WHAT IS{}", before, after);
            prop_assert_eq!(heuristic_intent(&query).intent_type, IntentType::Wiki);
            Ok(())
        })
        .unwrap();
}

/// Pipeline ids are unique and increasing
#[test]
fn test_pipeline_ids_increase() {
    let ids: Vec<PipelineId> = (0..100).map(|_| PipelineId::next()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}
