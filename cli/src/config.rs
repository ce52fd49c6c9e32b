use std::path::Path;

use docscan::ScanConfig;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Configuration for the CLI.
#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Limits used by the `scan` command. Missing keys take their default
    /// values.
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Load a config file from a given path. Path must contain a valid TOML file
/// or this function will propagate the error.
pub fn load_config_from_file(
    config_file: &Path,
) -> Result<Config, Box<figment::Error>> {
    let config: Config =
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file_exact(config_file))
            .extract()?;
    Ok(config)
}
