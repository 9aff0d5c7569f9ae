//! CLI presentation: rendering of events, site tables and check reports.

use crate::events::{AssistantEvent, EventEnvelope};
use crate::sites::SiteTable;
use owo_colors::OwoColorize;
use serde::Serialize;

/// Text rendering of one event. Chunks are returned verbatim so they can be
/// printed without a newline as they arrive.
pub fn format_event_text(event: &AssistantEvent) -> String {
    match event {
        AssistantEvent::IntentDetected { intent } => format!(
            "{}\n",
            format!(
                "[{:?} · confidence {:.2}] {}",
                intent.intent_type, intent.confidence, intent.rewritten_query
            )
            .dimmed()
        ),
        AssistantEvent::StreamChunk { text } => text.clone(),
        AssistantEvent::StreamFinished => "\n".to_string(),
        AssistantEvent::Notice { message } => format!("{}\n", message.yellow()),
        AssistantEvent::WikiResult { url, title } => {
            format!("{}\n{}\n", title.bold(), url.underline())
        }
        AssistantEvent::Error { message } => format!("{} {}\n", "error:".red().bold(), message),
    }
}

pub fn format_event_json(envelope: &EventEnvelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}

pub fn format_sites_text(sites: &SiteTable) -> String {
    let mut lines = vec![format!("{}", "Site mappings".bold().underline())];
    let mut empty = true;
    for mapping in sites.mappings() {
        empty = false;
        lines.push(format!(
            "  {:<32} engine: {:<16} wiki: {}",
            mapping.title,
            mapping.engine_key.as_ref().map(|k| k.as_str()).unwrap_or("-"),
            mapping.wiki_domain.as_deref().unwrap_or("-"),
        ));
    }
    if empty {
        lines.push("  (none configured)".to_string());
    }
    lines.join("\n")
}

pub fn format_sites_json(sites: &SiteTable) -> String {
    let mappings: Vec<_> = sites.mappings().collect();
    serde_json::to_string_pretty(&mappings).unwrap_or_else(|_| "[]".to_string())
}

/// Outcome of `gamewiki check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub config_errors: Vec<String>,
    pub provider: String,
    pub model: String,
    /// `Ok(true)` key found, `Ok(false)` none needed, `Err` missing
    pub credentials: Result<bool, String>,
    pub index_dir: String,
    pub index_dir_exists: bool,
    /// (engine key, index file present)
    pub indexes: Vec<(String, bool)>,
}

impl CheckReport {
    pub fn is_healthy(&self) -> bool {
        self.config_errors.is_empty()
    }
}

fn status(ok: bool) -> String {
    if ok {
        format!("{}", "ok".green())
    } else {
        format!("{}", "missing".red())
    }
}

pub fn format_check_report(report: &CheckReport) -> String {
    let mut lines = vec![format!("{}", "Configuration".bold().underline())];
    if report.config_errors.is_empty() {
        lines.push(format!("  {}", "valid".green()));
    } else {
        for error in &report.config_errors {
            lines.push(format!("  {} {}", "✗".red(), error));
        }
    }

    lines.push(String::new());
    lines.push(format!("{}", "Provider".bold().underline()));
    lines.push(format!("  {} / {}", report.provider, report.model));
    let credentials = match &report.credentials {
        Ok(true) => format!("{}", "api key found".green()),
        Ok(false) => "not required".to_string(),
        Err(msg) => format!("{} ({})", "missing".red(), msg),
    };
    lines.push(format!("  credentials: {}", credentials));

    lines.push(String::new());
    lines.push(format!("{}", "Indexes".bold().underline()));
    lines.push(format!(
        "  {} [{}]",
        report.index_dir,
        status(report.index_dir_exists)
    ));
    for (key, present) in &report.indexes {
        lines.push(format!("  {:<24} {}", key, status(*present)));
    }
    lines.join("\n")
}
