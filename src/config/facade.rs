//! Config loading entry point.

use super::merge::merge_policy;
use super::sources::{environment, global_file, workspace_file};
use super::AssistantConfig;
use crate::error::ApiError;
use config::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for a workspace.
    ///
    /// Order, lowest precedence first: defaults, global file, workspace
    /// files, environment.
    pub fn load(workspace_root: &Path) -> Result<AssistantConfig, ApiError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);

        let config: AssistantConfig = builder.build()?.try_deserialize()?;
        debug!(
            workspace = %workspace_root.display(),
            sites = config.sites.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load a single explicit file over the defaults.
    pub fn load_from_file(path: &Path) -> Result<AssistantConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config = merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }
}
