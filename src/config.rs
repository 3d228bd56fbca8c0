use crate::cli::Cli;
use crate::tag::TagTarget;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;
use tracing::info;

const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_SYNC_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_WEBSERVER_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tag and tag prefix cannot both be empty")]
    MissingTag,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Settings read from the optional YAML file. Every field can be overridden on the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub tag: Option<String>,
    pub tag_prefix: Option<String>,
    pub resync_interval_seconds: Option<u64>,
    pub sync_timeout_seconds: Option<u64>,
    pub skip_current_tag: Option<bool>,
    pub webserver: Option<Webserver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

/// Runtime configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: Option<String>,
    pub tag_target: TagTarget,
    pub skip_current_tag: bool,
    pub resync_interval: Duration,
    pub sync_timeout: Duration,
    pub kubeconfig: Option<PathBuf>,
    pub webserver: Webserver,
}

impl Config {
    pub fn load(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_config(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file)?)
    }

    /// Command line values win over file values, a fixed tag wins over a tag prefix.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());

        let fixed_tag = match cli.fixed_tag() {
            Some(tag) => Some(tag.to_string()),
            None => non_empty(file.tag),
        };
        let tag_prefix = non_empty(cli.tag_prefix).or(non_empty(file.tag_prefix));
        let tag_target = match (fixed_tag, tag_prefix) {
            (Some(tag), _) => TagTarget::Fixed(tag),
            (None, Some(prefix)) => TagTarget::Prefixed(prefix),
            (None, None) => return Err(ConfigError::MissingTag),
        };

        let resync_interval = cli
            .resync_interval
            .or(file.resync_interval_seconds)
            .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECONDS);
        if resync_interval == 0 {
            return Err(ConfigError::ZeroDuration("resync interval"));
        }
        let sync_timeout = cli
            .sync_timeout
            .or(file.sync_timeout_seconds)
            .unwrap_or(DEFAULT_SYNC_TIMEOUT_SECONDS);
        if sync_timeout == 0 {
            return Err(ConfigError::ZeroDuration("sync timeout"));
        }

        let port = cli
            .port
            .or(file.webserver.map(|w| w.port))
            .unwrap_or(DEFAULT_WEBSERVER_PORT);

        Ok(Config {
            namespace: non_empty(cli.namespace).or(non_empty(file.namespace)),
            tag_target,
            skip_current_tag: !cli.no_skip_current_tag && file.skip_current_tag.unwrap_or(true),
            resync_interval: Duration::from_secs(resync_interval),
            sync_timeout: Duration::from_secs(sync_timeout),
            kubeconfig: cli
                .kubeconfig
                .or_else(|| default_kubeconfig_path().filter(|p| p.exists())),
            webserver: Webserver { port },
        })
    }
}

/// `$HOME/.kube/config`
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    let home = env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".kube").join("config"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FileConfig> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        anyhow::bail!("Missing environment variable: {}", missing);
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}
