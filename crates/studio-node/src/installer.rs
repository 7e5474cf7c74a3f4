use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::archive;
use crate::error::{Error, Result};
use crate::fetch::{eq_hex_sha256, find_checksum, Fetcher, HttpFetcher};
use crate::lock::{self, LockOptions};
use crate::paths::{InstallLayout, RuntimeSpec, DEFAULT_DIST_URL};

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub dist_url: String,
    pub verify_checksums: bool,
    pub lock: LockOptions,
    pub download_timeout: Option<Duration>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            dist_url: DEFAULT_DIST_URL.to_string(),
            verify_checksums: true,
            lock: LockOptions::default(),
            download_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyInstalled,
    Installed { bytes: u64, sha256: String },
}

/// The runtime cache seen as a repository: "is it there" and "make it be there".
pub trait RuntimeCache {
    fn layout(&self) -> &InstallLayout;

    fn is_installed(&self) -> bool {
        self.layout().is_installed()
    }

    fn ensure_installed(&self) -> Result<InstallOutcome>;
}

pub struct RuntimeInstaller<F = HttpFetcher> {
    spec: RuntimeSpec,
    layout: InstallLayout,
    opts: InstallOptions,
    fetcher: F,
}

impl RuntimeInstaller<HttpFetcher> {
    pub fn new(spec: RuntimeSpec, base_dir: &Path, opts: InstallOptions) -> Self {
        let fetcher = HttpFetcher::new(opts.download_timeout);
        Self::with_fetcher(spec, base_dir, opts, fetcher)
    }
}

impl<F: Fetcher> RuntimeInstaller<F> {
    pub fn with_fetcher(spec: RuntimeSpec, base_dir: &Path, opts: InstallOptions, fetcher: F) -> Self {
        let layout = InstallLayout::new(&spec, base_dir);
        Self {
            spec,
            layout,
            opts,
            fetcher,
        }
    }

    pub fn spec(&self) -> &RuntimeSpec {
        &self.spec
    }

    pub fn download_url(&self) -> String {
        self.spec.download_url(&self.opts.dist_url)
    }

    fn install_locked(&self) -> Result<InstallOutcome> {
        let layout = &self.layout;
        if layout.versioned_dir.exists() {
            warn!(
                dir = %layout.versioned_dir.display(),
                "removing incomplete runtime install"
            );
            std::fs::remove_dir_all(&layout.versioned_dir).map_err(|e| {
                Error::io(format!("remove_dir_all {}", layout.versioned_dir.display()), e)
            })?;
        }
        remove_stale_staging(&layout.base_dir);

        let url = self.download_url();
        let archive_path = tempfile::TempPath::try_from_path(layout.archive_path(&self.spec))
            .map_err(|e| Error::io("resolve archive download path", e))?;
        info!(%url, version = self.spec.version(), "downloading node runtime");
        let downloaded = self.fetcher.fetch_to(&url, &archive_path)?;
        debug!(bytes = downloaded.bytes, sha256 = %downloaded.sha256, "download complete");

        if self.opts.verify_checksums {
            self.verify(&downloaded.sha256)?;
        }

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&layout.base_dir)
            .map_err(|e| Error::io(format!("create staging dir in {}", layout.base_dir.display()), e))?;
        info!("extracting node runtime");
        archive::extract(
            &archive_path,
            self.spec.profile().archive_format,
            staging.path(),
        )?;

        let extracted = staging.path().join(self.spec.dist_name());
        for required in [&layout.binary_path, &layout.package_manager_binary_path] {
            let staged = staged_path(&extracted, &layout.versioned_dir, required);
            if !staged.exists() {
                return Err(Error::Extraction {
                    archive: archive_path.to_path_buf(),
                    message: format!("archive does not contain {}", staged.display()),
                });
            }
            // Executable before the rename publishes the install.
            if self.spec.profile().needs_exec_bits() {
                make_executable(&staged)?;
            }
        }

        std::fs::rename(&extracted, &layout.versioned_dir).map_err(|e| {
            Error::io(
                format!(
                    "rename {} -> {}",
                    extracted.display(),
                    layout.versioned_dir.display()
                ),
                e,
            )
        })?;

        info!(dir = %layout.versioned_dir.display(), "node runtime installed");
        Ok(InstallOutcome::Installed {
            bytes: downloaded.bytes,
            sha256: downloaded.sha256,
        })
    }

    fn verify(&self, actual: &str) -> Result<()> {
        let checksums_url = self.spec.checksums_url(&self.opts.dist_url);
        let listing = self.fetcher.fetch_text(&checksums_url)?;
        let file = self.spec.archive_file_name();
        let expected = find_checksum(&listing, &file).ok_or_else(|| Error::Download {
            url: checksums_url.clone(),
            message: format!("no checksum listed for {file}"),
        })?;
        if !eq_hex_sha256(expected, actual) {
            return Err(Error::ChecksumMismatch {
                file,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!(%file, "checksum verified");
        Ok(())
    }
}

impl<F: Fetcher> RuntimeCache for RuntimeInstaller<F> {
    fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    fn ensure_installed(&self) -> Result<InstallOutcome> {
        if self.layout.is_installed() {
            debug!(binary = %self.layout.binary_path.display(), "node runtime present");
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        std::fs::create_dir_all(&self.layout.base_dir).map_err(|e| {
            Error::io(format!("create_dir_all {}", self.layout.base_dir.display()), e)
        })?;
        let mut lock = lock::acquire_with(&self.layout.lock_path(), self.opts.lock)?;

        let outcome = if self.layout.is_installed() {
            debug!("node runtime installed by another process while waiting");
            Ok(InstallOutcome::AlreadyInstalled)
        } else {
            self.install_locked()
        };
        let released = lock.release();
        let outcome = outcome?;
        released?;
        Ok(outcome)
    }
}

fn staged_path(extracted_root: &Path, final_root: &Path, final_path: &Path) -> PathBuf {
    match final_path.strip_prefix(final_root) {
        Ok(rel) => extracted_root.join(rel),
        Err(_) => final_path.to_path_buf(),
    }
}

fn remove_stale_staging(base_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        if let Err(err) = std::fs::remove_dir_all(entry.path()) {
            warn!(path = %entry.path().display(), "remove stale staging dir: {err}");
        }
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|source| {
        Error::Permission {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
