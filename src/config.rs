use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.repositories.is_empty() {
            return Err(anyhow!("repositories must not be empty"));
        }
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                return Err(anyhow!("repository name is required"));
            }
            if !repo.prefix.starts_with('/') {
                return Err(anyhow!(
                    "repository {} prefix must start with '/'",
                    repo.name
                ));
            }
            let uri = repo
                .upstream
                .trim_end_matches('/')
                .parse::<http::Uri>()
                .with_context(|| format!("repository {} upstream", repo.name))?;
            if uri.scheme_str() != Some("http") || uri.authority().is_none() {
                return Err(anyhow!(
                    "repository {} upstream must be an absolute http url",
                    repo.name
                ));
            }
        }
        Ok(())
    }

    pub fn origin_timeout(&self) -> Duration {
        if self.upstream.timeout.is_zero() {
            constants::DEFAULT_ORIGIN_TIMEOUT
        } else {
            self.upstream.timeout
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub log_requests: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            log_requests: false,
        }
    }
}

fn default_addr() -> String {
    ":3142".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct Upstream {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            dir: default_cache_dir(),
        }
    }
}

fn default_driver() -> String {
    "disk".to_string()
}

fn default_cache_dir() -> String {
    "./cache".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub upstream: String,
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
