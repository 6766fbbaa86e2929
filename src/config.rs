use std::{
    collections::HashMap,
    num::NonZeroU64,
    path::{Path, PathBuf},
    time::Duration,
};

use minijinja::Environment;

use crate::filter::NameFilter;

/// Placeholder in `checkpoint_path` replaced with the machine's hostname.
pub const HOSTNAME_PLACEHOLDER: &str = "%{HOSTNAME}";

fn default_runtime_endpoint() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["gogstash".to_string()]
}

fn default_checkpoint_path() -> String {
    format!("sincedb-{HOSTNAME_PLACEHOLDER}")
}

fn default_retry_interval_seconds() -> NonZeroU64 {
    NonZeroU64::new(10).expect("10 is not zero")
}

fn default_channel_capacity() -> usize {
    1024
}

/// The configuration file as written by the user.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_runtime_endpoint")]
    pub runtime_endpoint: String,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: NonZeroU64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            runtime_endpoint: default_runtime_endpoint(),
            include_patterns: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
            checkpoint_path: default_checkpoint_path(),
            retry_interval_seconds: default_retry_interval_seconds(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// How to reach the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// Honour `DOCKER_HOST`, falling back to the platform socket.
    LocalDefaults,
    Unix(String),
    Http(String),
}

impl RuntimeEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        if endpoint.trim().is_empty() {
            return Ok(Self::LocalDefaults);
        }
        let url = url::Url::parse(endpoint)
            .map_err(|e| ConfigError::Endpoint(format!("{endpoint}: {e}")))?;
        match url.scheme() {
            "unix" => Ok(Self::Unix(url.path().to_string())),
            "tcp" | "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| ConfigError::Endpoint(format!("{endpoint}: missing host")))?;
                let port = url.port().unwrap_or(2375);
                Ok(Self::Http(format!("http://{host}:{port}")))
            }
            scheme => Err(ConfigError::Endpoint(format!(
                "{endpoint}: unsupported scheme {scheme:?}"
            ))),
        }
    }
}

/// Resolved configuration, built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub runtime_endpoint: RuntimeEndpoint,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub checkpoint_path: PathBuf,
    pub retry_interval: Duration,
    pub channel_capacity: usize,
    pub hostname: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("Invalid container name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Invalid runtime endpoint {0}")]
    Endpoint(String),
    #[error("Unable to resolve hostname")]
    Hostname,
    #[error("channel_capacity must be greater than zero")]
    ChannelCapacity,
}

/// Render `${ NAME }` references against `vars`. Unknown names are errors.
pub fn render_template(
    template_str: &str,
    vars: &HashMap<String, String>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

pub fn resolve_checkpoint_path(template: &str, hostname: &str) -> PathBuf {
    PathBuf::from(template.replace(HOSTNAME_PLACEHOLDER, hostname))
}

impl ConfigFile {
    fn try_init_from_string(
        config: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars)?;
        Ok(toml::from_str(&rendered)?)
    }

    /// Read the file at `path`. A missing file yields the defaults.
    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config) => {
                let vars: HashMap<String, String> = std::env::vars().collect();
                Self::try_init_from_string(&config, &vars)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(path.to_path_buf(), e)),
        }
    }

    pub fn resolve(self, hostname: &str) -> Result<Config, ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::ChannelCapacity);
        }
        Ok(Config {
            runtime_endpoint: RuntimeEndpoint::parse(&self.runtime_endpoint)?,
            checkpoint_path: resolve_checkpoint_path(&self.checkpoint_path, hostname),
            include_patterns: self.include_patterns,
            exclude_patterns: self.exclude_patterns,
            retry_interval: Duration::from_secs(self.retry_interval_seconds.get()),
            channel_capacity: self.channel_capacity,
            hostname: hostname.to_string(),
        })
    }
}

impl Config {
    pub fn name_filter(&self) -> Result<NameFilter, ConfigError> {
        Ok(NameFilter::new(
            &self.include_patterns,
            &self.exclude_patterns,
        )?)
    }

    /// Load the configuration file and resolve it against this host.
    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let hostname = gethostname::gethostname()
            .into_string()
            .map_err(|_| ConfigError::Hostname)?;
        if hostname.is_empty() {
            return Err(ConfigError::Hostname);
        }
        ConfigFile::try_init(path)?.resolve(&hostname)
    }
}
