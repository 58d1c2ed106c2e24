use serde::Deserialize;
use tracing::debug;

use crate::datatype::CodecRegistry;
use crate::error::Result;

/// Values read from `facet.toml` (or another file) and `FACET_*` variables.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Prefix of derived store keys, e.g. `facet.sample/foo`.
    pub namespace: String,
    /// Partition new entities are allocated in.
    pub partition: String,
    /// `mem://<name>` or `file://<path>`.
    pub uri: String,
    /// Filter directive for the log subscriber of the binary.
    pub log_level: String,
}

impl Settings {
    /// Defaults, overlaid by the optional file, overlaid by the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .set_default("namespace", "facet")?
            .set_default("partition", "user")?
            .set_default("uri", "mem://default")?
            .set_default("log_level", "warn")?;
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(::config::Environment::with_prefix("FACET"))
            .build()?
            .try_deserialize()?;
        debug!(?settings, "Loaded settings");
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: String::from("facet"),
            partition: String::from("user"),
            uri: String::from("mem://default"),
            log_level: String::from("warn"),
        }
    }
}

/// What models are defined against: settings plus the codecs available to
/// attribute types.
pub struct Config {
    settings: Settings,
    codecs: CodecRegistry,
}

impl Config {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            codecs: CodecRegistry::new(),
        }
    }
    pub fn with_codecs(settings: Settings, codecs: CodecRegistry) -> Self {
        Self { settings, codecs }
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }
    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }
    pub fn partition(&self) -> &str {
        &self.settings.partition
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("settings", &self.settings)
            .finish()
    }
}
