//! Site-mapping table and wiki search URL construction.
//!
//! Maps a window title onto the engine that serves guide queries for it and
//! the wiki that answers lookups. Titles match as case-insensitive
//! substrings, longest title first.

use crate::config::{AssistantConfig, SiteEntry};
use crate::error::ApiError;
use crate::types::{EngineKey, GameContext};
use serde::Serialize;

const SEARCH_REDIRECT_PREFIX: &str = "https://duckduckgo.com/?q=!ducky+";

/// Resolved row of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteMapping {
    pub title: String,
    pub engine_key: Option<EngineKey>,
    pub wiki_domain: Option<String>,
}

/// A site search ready to hand to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiSearch {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
pub struct SiteTable {
    // Sorted by needle length, longest first
    rows: Vec<(String, SiteMapping)>,
    ignored: Vec<String>,
}

impl SiteTable {
    pub fn new(entries: &[SiteEntry], ignored_windows: &[String]) -> Self {
        let mut rows: Vec<(String, SiteMapping)> = entries
            .iter()
            .filter(|e| !e.title.trim().is_empty())
            .map(|e| {
                let mapping = SiteMapping {
                    title: e.title.clone(),
                    engine_key: e
                        .engine_key
                        .as_deref()
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(EngineKey::new),
                    wiki_domain: e.wiki_base_url.as_deref().and_then(extract_domain),
                };
                (e.title.trim().to_lowercase(), mapping)
            })
            .collect();
        // stable: equal lengths keep configuration order
        rows.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        let ignored = ignored_windows
            .iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        Self { rows, ignored }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        Self::new(&config.sites, &config.ignored_windows)
    }

    pub fn mappings(&self) -> impl Iterator<Item = &SiteMapping> {
        self.rows.iter().map(|(_, m)| m)
    }

    /// True for windows that belong to the assistant itself.
    pub fn is_ignored(&self, context: &GameContext) -> bool {
        let title = context.normalized();
        self.ignored.iter().any(|w| title.contains(w.as_str()))
    }

    /// Drop contexts that carry no information about the user's game.
    pub fn effective_context<'a>(&self, context: Option<&'a GameContext>) -> Option<&'a GameContext> {
        context.filter(|c| !c.as_str().trim().is_empty() && !self.is_ignored(c))
    }

    pub fn lookup(&self, context: &GameContext) -> Option<&SiteMapping> {
        if self.is_ignored(context) {
            return None;
        }
        let title = context.normalized();
        self.rows
            .iter()
            .find(|(needle, _)| title.contains(needle.as_str()))
            .map(|(_, m)| m)
    }

    pub fn engine_key_for_context(&self, context: &GameContext) -> Option<EngineKey> {
        self.lookup(context).and_then(|m| m.engine_key.clone())
    }

    pub fn wiki_domain_for_context(&self, context: &GameContext) -> Option<String> {
        self.lookup(context).and_then(|m| m.wiki_domain.clone())
    }

    /// A context is supported when it maps to an engine or a wiki.
    pub fn is_supported(&self, context: &GameContext) -> bool {
        self.lookup(context)
            .map(|m| m.engine_key.is_some() || m.wiki_domain.is_some())
            .unwrap_or(false)
    }

    /// Build the search redirect for `query`.
    ///
    /// Site-scoped when the context has a wiki, a general "<title> <query>
    /// wiki" search otherwise.
    pub fn wiki_search(
        &self,
        context: Option<&GameContext>,
        query: &str,
    ) -> Result<WikiSearch, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::WikiSearchFailed(
                "cannot search for an empty query".to_string(),
            ));
        }

        let context = self.effective_context(context);
        let search_terms = match context {
            Some(ctx) => match self.wiki_domain_for_context(ctx) {
                Some(domain) => format!("site:{} {}", domain, query),
                None => format!("{} {} wiki", ctx.as_str().trim(), query),
            },
            None => format!("{} wiki", query),
        };

        Ok(WikiSearch {
            url: search_url(&search_terms),
            title: format!("Search: {}", query),
        })
    }
}

pub fn search_url(terms: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(terms.as_bytes()).collect();
    format!("{}{}", SEARCH_REDIRECT_PREFIX, encoded)
}

/// Host of a wiki base URL; bare `host/path` forms keep their first segment.
pub fn extract_domain(base_url: &str) -> Option<String> {
    let base_url = base_url.trim();
    if base_url.is_empty() {
        return None;
    }
    let domain = if base_url.contains("://") {
        url::Url::parse(base_url).ok()?.host_str()?.to_string()
    } else {
        base_url.split('/').next()?.to_string()
    };
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}
