//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only scalar defaults that later layers commonly override are seeded here;
/// everything else falls back to the serde defaults on the config structs.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("provider.provider_type", "gemini")?
        .set_default("provider.model", "gemini-2.5-flash-lite")?
        .set_default("index.dir", "data/indexes")?
        .set_default("grounding.enabled", false)
}
