//! Acquires a pinned Node.js runtime into a per-user cache and supervises
//! the enochian studio server on top of it.

pub mod archive;
pub mod bundle;
pub mod env;
pub mod error;
pub mod fetch;
pub mod installer;
pub mod lock;
pub mod paths;
pub mod platform;
pub mod runner;
pub mod signal;
pub mod studio;
pub mod supervisor;

pub use bundle::{BundleScripts, ServerBundle};
pub use env::{ChildEnvironment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use installer::{InstallOptions, InstallOutcome, RuntimeCache, RuntimeInstaller};
pub use lock::{LockHandle, LockOptions};
pub use paths::{InstallLayout, RuntimeSpec};
pub use platform::{Arch, KillStrategy, Platform, PlatformProfile};
pub use runner::CommandRunner;
pub use signal::{Shutdown, SignalBridge};
pub use studio::{Studio, StudioOptions};
pub use supervisor::{ChildStatus, ProcessSupervisor, SupervisedProcess, SupervisorState};
