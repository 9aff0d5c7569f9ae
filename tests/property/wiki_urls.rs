//! Property-based tests for wiki search URL construction

use gamewiki::config::SiteEntry;
use gamewiki::sites::{search_url, SiteTable};
use gamewiki::GameContext;
use proptest::prelude::*;

const PREFIX: &str = "https://duckduckgo.com/?q=!ducky+";

fn table() -> SiteTable {
    SiteTable::new(
        &[SiteEntry {
            title: "Elden Ring".to_string(),
            engine_key: Some("eldenring".to_string()),
            wiki_base_url: Some("https://eldenring.wiki.fextralife.com/".to_string()),
        }],
        &[],
    )
}

fn decode(url: &str) -> String {
    let query = url.strip_prefix(PREFIX).unwrap();
    url::form_urlencoded::parse(format!("q={}", query).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

/// Any search terms survive encoding and the URL stays a single token
#[test]
fn test_search_url_round_trips_terms() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<String>(), |terms| {
            let url = search_url(&terms);
            prop_assert!(url.starts_with(PREFIX));
            prop_assert!(!url.contains(' '));
            prop_assert!(!url[PREFIX.len()..].contains('&'));
            prop_assert_eq!(decode(&url), terms);
            Ok(())
        })
        .unwrap();
}

/// Site-scoped searches always carry the wiki domain and the trimmed query
#[test]
fn test_site_scoped_search_shape() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let table = table();
    let context = GameContext::new("Elden Ring");

    runner
        .run(&"[a-zA-Z0-9 ?]{0,30}[a-zA-Z0-9]", |query| {
            let search = table.wiki_search(Some(&context), &query).unwrap();
            let decoded = decode(&search.url);
            prop_assert_eq!(
                decoded,
                format!("site:eldenring.wiki.fextralife.com {}", query.trim())
            );
            prop_assert_eq!(search.title, format!("Search: {}", query.trim()));
            Ok(())
        })
        .unwrap();
}

/// Blank queries never produce a URL
#[test]
fn test_blank_queries_rejected() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let table = table();

    runner
        .run(&"[ \t\n]{0,10}", |query| {
            prop_assert!(table.wiki_search(None, &query).is_err());
            Ok(())
        })
        .unwrap();
}
