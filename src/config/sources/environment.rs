//! Environment source: GAMEWIKI__SECTION__KEY overrides any file value.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::Environment;

pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("GAMEWIKI")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}
