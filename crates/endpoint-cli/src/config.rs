//! Endpoint CLI Configuration Loading
//!
//! Layered with figment, lowest priority first:
//! - Default values
//! - Configuration file (`--config`, TOML)
//! - Environment variables (`ENDPOINT_*`, sections separated by `__`,
//!   e.g. `ENDPOINT_MESSENGER__QUEUE_CAPACITY=32`)

use std::path::Path;

use endpoint_runtime::EndpointConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::info;

use crate::error::{CliError, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "ENDPOINT_";

/// Load the effective configuration
pub fn load_config(config_path: Option<&str>) -> Result<EndpointConfig> {
    let mut figment = Figment::new().merge(Serialized::defaults(EndpointConfig::default()));

    if let Some(path) = config_path {
        if !Path::new(path).exists() {
            return Err(CliError::Config(format!("configuration file not found: {}", path)));
        }
        info!("Loading configuration from: {}", path);
        figment = figment.merge(Toml::file(path));
    }

    let config: EndpointConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    config.validate().map_err(CliError::Config)?;
    Ok(config)
}

/// Render a configuration as TOML
pub fn to_toml(config: &EndpointConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.messenger.queue_capacity, 100);
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = load_config(Some("/nonexistent/endpoint.toml"));
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("endpoint-cli-{}.toml", std::process::id()));
        std::fs::write(&path, "[messenger]\nqueue_capacity = 7\n\n[bridge]\nbatch_limit = 3\n")
            .unwrap();

        let config = load_config(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.messenger.queue_capacity, 7);
        assert_eq!(config.bridge.batch_limit, 3);
        assert_eq!(config.bridge.thread_name, "endpoint-bridge");
    }

    #[test]
    fn test_toml_output_round_trips() {
        let config = EndpointConfig::testing();
        let text = to_toml(&config).unwrap();
        let back: EndpointConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
