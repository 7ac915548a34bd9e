use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use mg_cache::CachePolicy;
use mg_link::LinkConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of nested environment overrides, e.g. `MG__LINK__HTTP_ENDPOINT`
pub const ENV_PREFIX: &str = "MG__";

/// Shortcut variables for the two gateway endpoints
pub const GATEWAY_URL_VAR: &str = "GATEWAY_URL";
pub const GATEWAY_STREAM_URL_VAR: &str = "GATEWAY_STREAM_URL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub link: LinkConfig,
    pub cache: CachePolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            link: LinkConfig::default(),
            cache: CachePolicy::metagothic(),
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the YAML file, then `MG__*` variables,
    /// then the `GATEWAY_URL` / `GATEWAY_STREAM_URL` shortcuts.
    ///
    /// # Errors
    /// Fails when `path` is given but is not a file, or when a layer does not
    /// deserialize into the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.is_file() {
                bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }

        let figment = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(
                Env::raw()
                    .only(&[GATEWAY_URL_VAR])
                    .map(|_| "link.http_endpoint".into()),
            )
            .merge(
                Env::raw()
                    .only(&[GATEWAY_STREAM_URL_VAR])
                    .map(|_| "link.stream_endpoint".into()),
            );

        let config: Self = figment.extract().context("invalid configuration")?;
        config.cache.validate().context("invalid cache policy")?;
        Ok(config)
    }

    /// `-v` info, `-vv` debug, `-vvv` trace
    pub fn apply_verbosity(&mut self, verbose: u8) {
        let level = match verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        self.logging.level = level.to_owned();
    }

    /// # Errors
    /// Fails if the configuration cannot be represented as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("failed to render configuration")
    }
}
