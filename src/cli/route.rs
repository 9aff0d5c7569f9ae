//! CLI route: dispatches parsed commands to the controller and formatters.

use super::parse::Commands;
use super::presentation::{
    format_check_report, format_event_json, format_event_text, format_sites_json,
    format_sites_text, CheckReport,
};
use crate::config::{AssistantConfig, ConfigLoader};
use crate::controller::Controller;
use crate::error::ApiError;
use crate::events::AssistantEvent;
use crate::sites::SiteTable;
use crate::types::{GameContext, SearchMode};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on a single `ask`, so a stuck backend never hangs the terminal.
const ASK_DEADLINE: Duration = Duration::from_secs(180);

/// Rendered result of a command. `success == false` maps to a non-zero exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub success: bool,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self {
            text,
            success: true,
        }
    }
}

pub struct RunContext {
    config: AssistantConfig,
    workspace_root: PathBuf,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        Ok(Self::from_config(workspace_root, config))
    }

    /// Relative index paths are taken relative to the workspace root.
    pub fn from_config(workspace_root: PathBuf, mut config: AssistantConfig) -> Self {
        if config.index.dir.is_relative() {
            config.index.dir = workspace_root.join(&config.index.dir);
        }
        Self {
            config,
            workspace_root,
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<CommandOutput, ApiError> {
        match command {
            Commands::Ask {
                query,
                window,
                mode,
                json,
            } => {
                let mode: SearchMode = mode.parse().map_err(ApiError::ConfigError)?;
                let runtime = tokio::runtime::Runtime::new().map_err(|e| {
                    ApiError::ConfigError(format!("Failed to create Tokio runtime: {}", e))
                })?;
                runtime.block_on(self.ask(&query.join(" "), window.as_deref(), mode, *json))
            }
            Commands::Sites { format } => {
                let table = SiteTable::from_config(&self.config);
                let text = match format.as_str() {
                    "json" => format_sites_json(&table),
                    "text" => format_sites_text(&table),
                    other => {
                        return Err(ApiError::ConfigError(format!(
                            "Invalid format: {} (must be 'text' or 'json')",
                            other
                        )))
                    }
                };
                Ok(CommandOutput::ok(text))
            }
            Commands::Check => {
                let report = self.check();
                Ok(CommandOutput {
                    text: format_check_report(&report),
                    success: report.is_healthy(),
                })
            }
        }
    }

    async fn ask(
        &self,
        query: &str,
        window: Option<&str>,
        mode: SearchMode,
        json: bool,
    ) -> Result<CommandOutput, ApiError> {
        let config = self.config.clone().validated()?;
        let (controller, mut events) = Controller::from_config(&config)?;
        controller.preload();

        let context = window.map(GameContext::new);
        let id = controller.submit_query(query, context, mode);
        info!(pipeline_id = %id, workspace = %self.workspace_root.display(), "Query started");

        let mut success = true;
        let drained = tokio::time::timeout(ASK_DEADLINE, async {
            let mut stdout = std::io::stdout();
            while let Some(envelope) = events.recv().await {
                if envelope.pipeline != id {
                    continue;
                }
                if matches!(envelope.event, AssistantEvent::Error { .. }) {
                    success = false;
                }
                let rendered = if json {
                    format!("{}\n", format_event_json(&envelope))
                } else {
                    format_event_text(&envelope.event)
                };
                // Best effort: a closed pipe only loses output
                let _ = stdout.write_all(rendered.as_bytes());
                let _ = stdout.flush();
                if envelope.event.is_terminal() {
                    break;
                }
            }
        })
        .await;

        controller.shutdown().await;
        if drained.is_err() {
            return Err(ApiError::ProviderTimeout(format!(
                "no answer within {}s",
                ASK_DEADLINE.as_secs()
            )));
        }
        debug!(pipeline_id = %id, success, "Query finished");
        Ok(CommandOutput {
            text: String::new(),
            success,
        })
    }

    fn check(&self) -> CheckReport {
        let config_errors = match self.config.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
        };
        let credentials = self
            .config
            .provider
            .resolve_api_key()
            .map(|key| key.is_some())
            .map_err(|e| e.to_string());

        let index_dir = &self.config.index.dir;
        let keys: BTreeSet<&str> = self
            .config
            .sites
            .iter()
            .filter_map(|s| s.engine_key.as_deref())
            .collect();
        let indexes = keys
            .into_iter()
            .map(|key| {
                let present = index_dir.join(format!("{}.json", key)).is_file();
                (key.to_string(), present)
            })
            .collect();

        CheckReport {
            config_errors,
            provider: format!("{:?}", self.config.provider.provider_type),
            model: self.config.provider.model.clone(),
            credentials,
            index_dir: index_dir.display().to_string(),
            index_dir_exists: index_dir.is_dir(),
            indexes,
        }
    }
}
