use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::platform::{Arch, Platform, PlatformProfile};

pub const DEFAULT_NODE_VERSION: &str = "22.9.0";
pub const DEFAULT_DIST_URL: &str = "https://nodejs.org/dist";

pub const LOCK_FILE_NAME: &str = ".node_download.lock";
pub const CHECKSUMS_FILE_NAME: &str = "SHASUMS256.txt";

/// Pinned runtime version for one host profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    version: String,
    profile: PlatformProfile,
}

impl RuntimeSpec {
    pub fn new(version: &str, profile: PlatformProfile) -> Result<Self> {
        let version = normalize_version(version)?;
        Ok(Self { version, profile })
    }

    pub fn for_host(version: &str) -> Result<Self> {
        Self::new(version, PlatformProfile::host()?)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// `node-v22.9.0-linux-x64`: the top-level directory inside the archive.
    pub fn dist_name(&self) -> String {
        format!(
            "node-v{}-{}-{}",
            self.version,
            self.profile.platform.dist_token(),
            self.profile.arch
        )
    }

    pub fn archive_file_name(&self) -> String {
        format!(
            "{}.{}",
            self.dist_name(),
            self.profile.archive_format.extension()
        )
    }

    pub fn download_url(&self, dist_url: &str) -> String {
        format!(
            "{}/v{}/{}",
            dist_url.trim_end_matches('/'),
            self.version,
            self.archive_file_name()
        )
    }

    pub fn checksums_url(&self, dist_url: &str) -> String {
        format!(
            "{}/v{}/{CHECKSUMS_FILE_NAME}",
            dist_url.trim_end_matches('/'),
            self.version
        )
    }
}

fn normalize_version(raw: &str) -> Result<String> {
    let invalid = |why| Error::InvalidVersion {
        version: raw.to_string(),
        why,
    };
    let v = raw.trim();
    let v = v.strip_prefix('v').unwrap_or(v);
    if v.is_empty() {
        return Err(invalid("must be non-empty"));
    }
    if v.contains('/') || v.contains('\\') {
        return Err(invalid("contains path separators"));
    }
    if v.contains("..") {
        return Err(invalid("contains '..'"));
    }
    if !v
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'))
    {
        return Err(invalid("contains characters outside [A-Za-z0-9.+-]"));
    }
    Ok(v.to_string())
}

/// Where a [`RuntimeSpec`] lives inside a cache base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub base_dir: PathBuf,
    pub versioned_dir: PathBuf,
    pub binary_path: PathBuf,
    pub package_manager_binary_path: PathBuf,
    pub bin_dir: PathBuf,
    pub module_dir: PathBuf,
}

impl InstallLayout {
    pub fn new(spec: &RuntimeSpec, base_dir: &Path) -> Self {
        let profile = spec.profile();
        let versioned_dir = base_dir.join(format!("node-{}", spec.version()));
        let bin_dir = match profile.bin_subdir() {
            Some(sub) => versioned_dir.join(sub),
            None => versioned_dir.clone(),
        };
        Self {
            base_dir: base_dir.to_path_buf(),
            binary_path: bin_dir.join(profile.interpreter_file_name()),
            package_manager_binary_path: bin_dir.join(profile.package_manager_file_name()),
            module_dir: versioned_dir.join(profile.module_subdir()),
            bin_dir,
            versioned_dir,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE_NAME)
    }

    pub fn archive_path(&self, spec: &RuntimeSpec) -> PathBuf {
        self.base_dir.join(spec.archive_file_name())
    }

    /// Both binaries present. A half-populated directory does not count.
    pub fn is_installed(&self) -> bool {
        self.binary_path.is_file() && self.package_manager_binary_path.is_file()
    }
}

pub fn resolve(
    version: &str,
    platform: Platform,
    arch: Arch,
    base_dir: &Path,
) -> Result<InstallLayout> {
    let spec = RuntimeSpec::new(version, PlatformProfile::new(platform, arch)?)?;
    Ok(InstallLayout::new(&spec, base_dir))
}
