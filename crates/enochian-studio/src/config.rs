use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use studio_node::paths::{DEFAULT_DIST_URL, DEFAULT_NODE_VERSION};
use studio_node::signal::DEFAULT_CHILD_POLL;
use studio_node::studio::STUDIO_PORT;
use studio_node::supervisor::DEFAULT_KILL_GRACE;
use studio_node::{InstallOptions, LockOptions, StudioOptions};

pub const CONFIG_SCHEMA_VERSION: &str = "enochian-studio.config@0.1.0";

pub const ENV_ROOT: &str = "ENOCHIAN_STUDIO_ROOT";
pub const ENV_CONFIG: &str = "ENOCHIAN_STUDIO_CONFIG";
pub const ENV_NODE_VERSION: &str = "ENOCHIAN_STUDIO_NODE_VERSION";
pub const ENV_DIST_URL: &str = "ENOCHIAN_STUDIO_DIST_URL";
pub const ENV_PORT: &str = "ENOCHIAN_STUDIO_PORT";

const CACHE_DIR_NAME: &str = ".node_runner";
const BUNDLE_DIR_NAME: &str = "bundle";

/// On-disk `config.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_checksums: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_poll_ms: Option<u64>,
    /// `0` disables age-based reclaim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_stale_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_poll_ms: Option<u64>,
    /// Relative paths are resolved against the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
}

impl Config {
    /// A missing file is an empty config unless `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        if !required && !path.is_file() {
            return Ok(Self {
                schema_version: CONFIG_SCHEMA_VERSION.to_string(),
                ..Self::default()
            });
        }
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Self =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        if cfg.schema_version != CONFIG_SCHEMA_VERSION {
            bail!(
                "unsupported config schema_version: {} (expected {CONFIG_SCHEMA_VERSION})",
                cfg.schema_version
            );
        }
        Ok(cfg)
    }
}

/// Values given on the command line; these win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub node_version: Option<String>,
    pub dist_url: Option<String>,
    pub port: Option<u16>,
    pub bundle_dir: Option<PathBuf>,
    pub no_verify: bool,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub cache_dir: PathBuf,
    pub bundle_dir: PathBuf,
    pub node_version: String,
    pub port: u16,
    pub install: InstallOptions,
    pub kill_grace: Duration,
    pub child_poll: Duration,
}

impl Settings {
    /// Flags > environment > config file > defaults.
    pub fn resolve(flags: &Overrides, env: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let env_str = |key: &str| -> Option<String> {
            env(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string_lossy().into_owned())
        };

        let root = match (&flags.root, env(ENV_ROOT).filter(|v| !v.is_empty())) {
            (Some(root), _) => root.clone(),
            (None, Some(root)) => PathBuf::from(root),
            (None, None) => default_root(&env)?,
        };

        let (config_path, required) = match (&flags.config, env(ENV_CONFIG).filter(|v| !v.is_empty())) {
            (Some(p), _) => (p.clone(), true),
            (None, Some(p)) => (PathBuf::from(p), true),
            (None, None) => (root.join("config.json"), false),
        };
        let cfg = Config::load(&config_path, required)?;

        let node_version = flags
            .node_version
            .clone()
            .or_else(|| env_str(ENV_NODE_VERSION))
            .or(cfg.node_version)
            .unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string());

        let dist_url = flags
            .dist_url
            .clone()
            .or_else(|| env_str(ENV_DIST_URL))
            .or(cfg.dist_url)
            .unwrap_or_else(|| DEFAULT_DIST_URL.to_string());

        let port = match (flags.port, env_str(ENV_PORT)) {
            (Some(p), _) => p,
            (None, Some(raw)) => raw
                .trim()
                .parse()
                .with_context(|| format!("parse {ENV_PORT}={raw:?}"))?,
            (None, None) => cfg.port.unwrap_or(STUDIO_PORT),
        };
        if port == 0 {
            bail!("port must be non-zero");
        }

        let bundle_dir = match flags.bundle_dir.clone().or(cfg.bundle_dir) {
            Some(p) if p.is_relative() => root.join(p),
            Some(p) => p,
            None => root.join(BUNDLE_DIR_NAME),
        };

        let lock_defaults = LockOptions::default();
        let lock = LockOptions {
            timeout: cfg
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(lock_defaults.timeout),
            poll_interval: match cfg.lock_poll_ms {
                Some(0) => bail!("lock_poll_ms must be non-zero"),
                Some(ms) => Duration::from_millis(ms),
                None => lock_defaults.poll_interval,
            },
            stale_after: match cfg.lock_stale_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => lock_defaults.stale_after,
            },
        };

        let child_poll = match cfg.child_poll_ms {
            Some(0) => bail!("child_poll_ms must be non-zero"),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_CHILD_POLL,
        };

        Ok(Self {
            cache_dir: root.join(CACHE_DIR_NAME),
            bundle_dir,
            node_version,
            port,
            install: InstallOptions {
                dist_url,
                verify_checksums: !flags.no_verify && cfg.verify_checksums.unwrap_or(true),
                lock,
                download_timeout: cfg.download_timeout_ms.map(Duration::from_millis),
            },
            kill_grace: cfg
                .kill_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_KILL_GRACE),
            child_poll,
            config_path,
            root,
        })
    }

    pub fn studio_options(&self) -> StudioOptions {
        StudioOptions {
            port: self.port,
            kill_grace: self.kill_grace,
            child_poll: self.child_poll,
            env: Vec::new(),
        }
    }
}

fn default_root(env: &impl Fn(&str) -> Option<OsString>) -> Result<PathBuf> {
    Ok(home_dir(env)?.join(".enochian-studio"))
}

fn home_dir(env: &impl Fn(&str) -> Option<OsString>) -> Result<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Some(v) = env(key).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(v));
        }
    }
    if let (Some(drive), Some(path)) = (env("HOMEDRIVE"), env("HOMEPATH")) {
        let mut s = OsString::new();
        s.push(drive);
        s.push(path);
        if !s.is_empty() {
            return Ok(PathBuf::from(s));
        }
    }
    bail!("could not determine home directory (HOME/USERPROFILE/HOMEDRIVE+HOMEPATH)");
}
