//! Configuration loading.
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional `config/default.*` file, and `INAPP__<SECTION>__<KEY>` environment
//! variables.

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    LoggingSettings, PartialSettings, PersistenceSettings, QueueSettings, Settings, SiteSettings,
    SseSettings,
};

/// Loads the configuration from the default file and environment variables,
/// merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("INAPP")
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merged(partial))
}
