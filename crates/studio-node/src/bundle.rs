use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::runner::CommandRunner;

pub const STUDIO_PACKAGE: &str = "@zolinthecow/enochian-studio";
pub const STUDIO_PACKAGE_VERSION: &str = "0.0.1-alpha.0";

/// The directory holding the studio's npm install and its two entry scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBundle {
    dir: PathBuf,
}

impl ServerBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn node_modules(&self) -> PathBuf {
        self.dir.join("node_modules")
    }

    pub fn package_json(&self) -> PathBuf {
        self.dir.join("package.json")
    }

    fn package_root(&self) -> PathBuf {
        let mut p = self.node_modules();
        p.extend(STUDIO_PACKAGE.split('/'));
        p
    }

    pub fn migrate_script(&self) -> PathBuf {
        self.package_root().join("migrate.js")
    }

    pub fn server_script(&self) -> PathBuf {
        self.package_root()
            .join(".output")
            .join("server")
            .join("index.mjs")
    }

    /// Both scripts, or the first one that is missing.
    pub fn locate(&self) -> Result<BundleScripts> {
        let migrate = self.migrate_script();
        if !migrate.is_file() {
            return Err(Error::MissingBundledScript { path: migrate });
        }
        let server = self.server_script();
        if !server.is_file() {
            return Err(Error::MissingBundledScript { path: server });
        }
        Ok(BundleScripts { migrate, server })
    }

    /// Runs `npm install` in the bundle when `node_modules` is absent.
    /// Returns whether an install happened.
    pub fn ensure_dependencies(&self, runner: &CommandRunner) -> Result<bool> {
        if self.node_modules().is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::io(format!("create_dir_all {}", self.dir.display()), e))?;
        self.write_package_json()?;

        info!(dir = %self.dir.display(), "installing studio npm dependencies");
        runner.npm(["install"], Some(&self.dir))?;
        info!(dir = %self.node_modules().display(), "studio npm dependencies installed");
        Ok(true)
    }

    /// Leaves an existing `package.json` untouched.
    pub fn write_package_json(&self) -> Result<()> {
        let path = self.package_json();
        if path.exists() {
            return Ok(());
        }
        let doc = serde_json::json!({
            "name": "enochian-studio-npm-deps",
            "version": "1.0.0",
            "private": true,
            "dependencies": { STUDIO_PACKAGE: STUDIO_PACKAGE_VERSION },
        });
        let mut bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::io(format!("encode {}", path.display()), e.into()))?;
        bytes.push(b'\n');
        std::fs::write(&path, bytes).map_err(|e| Error::io(format!("write {}", path.display()), e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleScripts {
    pub migrate: PathBuf,
    pub server: PathBuf,
}
