use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Darwin,
    Linux,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
        }
    }

    /// Platform segment used in upstream archive names.
    pub fn dist_token(self) -> &'static str {
        match self {
            Platform::Windows => "win",
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "windows" | "win" => Ok(Platform::Windows),
            "darwin" | "macos" => Ok(Platform::Darwin),
            "linux" => Ok(Platform::Linux),
            other => Err(Error::UnsupportedPlatform {
                os: other.to_string(),
                arch: String::new(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X64,
    X86,
    Arm64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X86 => "x86",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x64" | "x86_64" | "amd64" => Ok(Arch::X64),
            "x86" | "i686" | "i386" => Ok(Arch::X86),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(Error::UnsupportedPlatform {
                os: String::new(),
                arch: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStrategy {
    /// Signal the whole process group (`kill(-pgid, ..)`).
    ProcessGroup,
    /// Forceful tree kill by pid (`taskkill /F /T`).
    TreeKill,
}

/// Everything that differs between hosts, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub arch: Arch,
    pub archive_format: ArchiveFormat,
    pub path_list_separator: char,
    pub kill_strategy: KillStrategy,
}

impl PlatformProfile {
    pub fn new(platform: Platform, arch: Arch) -> Result<Self> {
        let supported = match platform {
            Platform::Windows => true,
            Platform::Darwin | Platform::Linux => arch != Arch::X86,
        };
        if !supported {
            return Err(Error::UnsupportedPlatform {
                os: platform.to_string(),
                arch: arch.to_string(),
            });
        }

        let windows = platform == Platform::Windows;
        Ok(Self {
            platform,
            arch,
            archive_format: if windows {
                ArchiveFormat::Zip
            } else {
                ArchiveFormat::TarGz
            },
            path_list_separator: if windows { ';' } else { ':' },
            kill_strategy: if windows {
                KillStrategy::TreeKill
            } else {
                KillStrategy::ProcessGroup
            },
        })
    }

    pub fn host() -> Result<Self> {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let unsupported = || Error::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let platform = match os {
            "linux" => Platform::Linux,
            "macos" => Platform::Darwin,
            "windows" => Platform::Windows,
            _ => return Err(unsupported()),
        };
        let arch_v = match arch {
            "x86_64" => Arch::X64,
            "x86" => Arch::X86,
            "aarch64" => Arch::Arm64,
            _ => return Err(unsupported()),
        };
        Self::new(platform, arch_v)
    }

    pub fn is_windows(&self) -> bool {
        self.platform == Platform::Windows
    }

    /// Directory under the install root holding the executables, if any.
    pub fn bin_subdir(&self) -> Option<&'static str> {
        if self.is_windows() {
            None
        } else {
            Some("bin")
        }
    }

    pub fn interpreter_file_name(&self) -> &'static str {
        if self.is_windows() {
            "node.exe"
        } else {
            "node"
        }
    }

    pub fn package_manager_file_name(&self) -> &'static str {
        if self.is_windows() {
            "npm.cmd"
        } else {
            "npm"
        }
    }

    /// Bundled global module directory, relative to the install root.
    pub fn module_subdir(&self) -> &'static str {
        if self.is_windows() {
            "node_modules"
        } else {
            "lib/node_modules"
        }
    }

    /// Archives do not reliably carry the executable bit through extraction.
    pub fn needs_exec_bits(&self) -> bool {
        !self.is_windows()
    }

    pub fn path_var_name(&self) -> &'static str {
        if self.is_windows() {
            "Path"
        } else {
            "PATH"
        }
    }
}
