use std::io::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

pub const INSTALL_SCHEMA_VERSION: &str = "enochian-studio.install@0.1.0";
pub const PATHS_SCHEMA_VERSION: &str = "enochian-studio.paths@0.1.0";

#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub schema_version: &'static str,
    pub ok: bool,
    pub root: String,
    pub node_version: String,
    pub platform: String,
    pub arch: String,
    pub dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Serialize)]
pub struct PathsReport {
    pub schema_version: &'static str,
    pub ok: bool,
    pub root: String,
    pub config: String,
    pub cache_dir: String,
    pub node_version: String,
    pub platform: String,
    pub arch: String,
    pub install_dir: String,
    pub node: String,
    pub npm: String,
    pub module_dir: String,
    pub lock: String,
    pub download_url: String,
    pub installed: bool,
    pub bundle_dir: String,
    pub migrate_script: String,
    pub server_script: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorReport {
    pub fn from_error(err: &studio_node::Error) -> Self {
        let hint = match err {
            studio_node::Error::LockTimeout { path, .. } => Some(format!(
                "another invocation may be installing; remove {} if no other process is running",
                path.display()
            )),
            studio_node::Error::MissingBundledScript { .. } => {
                Some("remove the bundle's node_modules to reinstall it".to_string())
            }
            _ if err.is_retryable() => Some("retrying may succeed".to_string()),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: render_chain(err),
            hint,
        }
    }
}

/// `outer: inner: root`, the same shape anyhow prints for `{:#}`.
fn render_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}

#[derive(Debug)]
pub struct Reporter {
    pub json: bool,
    pub quiet: bool,
}

impl Reporter {
    /// Human-facing result line on stdout; suppressed in JSON and quiet modes.
    pub fn line(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        println!("{msg}");
    }

    pub fn failure(&self, err: &studio_node::Error) {
        if self.json {
            return;
        }
        let report = ErrorReport::from_error(err);
        eprintln!("error[{}]: {}", report.code, report.message);
        if let Some(hint) = report.hint {
            eprintln!("hint: {hint}");
        }
    }
}

pub fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}
