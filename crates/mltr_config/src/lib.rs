use config::{Config as ConfigRs, ConfigError as RsConfigError, Environment, File};
use mltr_types::AppConfig;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error accessing configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parsing or validation error: {0}")]
    Config(#[from] RsConfigError),
}

/// Loads the MLTR configuration.
///
/// Merges configuration from three sources, lowest precedence first:
/// 1. Built-in defaults (`AppConfig::default()`).
/// 2. An optional `mltr.toml` in the current working directory.
/// 3. Environment variables prefixed with `MLTR_`, nested keys separated
///    by `__` (e.g. `MLTR_BROKER__BOOTSTRAP_SERVERS=kafka:9092`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    debug!("Building configuration sources...");
    let defaults = ConfigRs::try_from(&AppConfig::default())?;

    let builder = ConfigRs::builder()
        // 1. Built-in defaults (lowest precedence)
        .add_source(defaults)
        // 2. Optional config file in the working directory
        .add_source(File::with_name("mltr").required(false))
        // 3. Environment variables (highest precedence)
        .add_source(
            Environment::with_prefix("MLTR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

    debug!("Building and deserializing configuration...");
    let config_rs = builder.build()?;
    let app_config = config_rs.try_deserialize::<AppConfig>()?;

    info!("Configuration loaded successfully.");
    Ok(app_config)
}
