use crate::provider::Engine;
use config::FileFormat;
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::{borrow::Cow, error::Error};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub watcher: Watcher,
    pub store: Store,
    pub fetcher: Fetcher,
    pub provider: Provider,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Watcher {
    /// How often the foreground ticker polls watched runs, in seconds.
    pub poll_interval_secs: u64,

    /// Minimum interval the OS background scheduler should be registered
    /// with, in seconds. The registration itself happens in platform code;
    /// this value is what it should pass.
    pub background_min_interval_secs: u64,

    /// How many recent runs to sample when estimating a new watch's duration.
    pub history_sample_size: u32,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Store {
    /// Root directory for the artifact cache. When unset a per-user cache
    /// directory is used.
    pub path: Option<String>,

    /// Maximum number of cached artifacts kept on disk.
    pub max_entries: usize,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Fetcher {
    /// File extension of the installable payload inside an unpacked artifact.
    pub payload_extension: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub engine: Engine,
    pub github: Option<GithubProvider>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct GithubProvider {
    pub api_base_url: String,
}

impl Config {
    /// returns an embedded default configuration file in bytes.
    fn default_config() -> Cow<'static, [u8]> {
        let config_file = EmbeddedConfigFS::get("default_courier_config.toml").unwrap();
        config_file.data
    }

    /// returns the default configuration paths that are searched in case user does not specify.
    fn config_paths() -> Vec<String> {
        let mut paths = vec!["/etc/courier/courier.toml".to_string()];

        if let Some(user_config) = dirs::config_dir() {
            paths.push(user_config.join("courier.toml").to_string_lossy().to_string());
        }

        paths
    }

    /// returns a correctly deserialized config struct from the configuration files and environment passed to it.
    ///
    /// Sources layer in order: embedded defaults, then user config files, then `COURIER_*` env
    /// vars, so any conflicting keys inherit the last source's value.
    pub fn parse(path_override: &Option<String>) -> Result<Config, Box<dyn Error>> {
        let mut config_src_builder = config::Config::builder();

        // First parse embedded config defaults.
        let default_config_raw = Self::default_config();
        let default_config = std::str::from_utf8(&default_config_raw)?;

        config_src_builder =
            config_src_builder.add_source(config::File::from_str(default_config, FileFormat::Toml));

        // Then parse user given paths.
        match path_override {
            None => {
                for path in Self::config_paths() {
                    config_src_builder =
                        config_src_builder.add_source(config::File::with_name(&path).required(false));
                }
            }
            Some(path) => {
                config_src_builder =
                    config_src_builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // Lastly env vars always override everything.
        let config_src = config_src_builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()?;

        let parsed_config = config_src.try_deserialize::<Config>()?;
        Ok(parsed_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    /// Test that the default config is properly parsed from the embedded configuration file.
    fn parse_default_config_from_file() {
        let default_config_raw = Config::default_config();
        let default_config = std::str::from_utf8(&default_config_raw).unwrap();

        let config_src = config::Config::builder()
            .add_source(config::File::from_str(default_config, FileFormat::Toml))
            .build()
            .unwrap();

        let parsed_config = config_src.try_deserialize::<Config>().unwrap();
        let expected_config = Config {
            general: General {
                log_level: "info".to_string(),
            },
            watcher: Watcher {
                poll_interval_secs: 30,
                background_min_interval_secs: 900,
                history_sample_size: 20,
            },
            store: Store {
                path: None,
                max_entries: 5,
            },
            fetcher: Fetcher {
                payload_extension: "apk".to_string(),
            },
            provider: Provider {
                engine: Engine::Github,
                github: Some(GithubProvider {
                    api_base_url: "https://api.github.com".to_string(),
                }),
            },
        };

        assert_eq!(parsed_config, expected_config);
    }
}
