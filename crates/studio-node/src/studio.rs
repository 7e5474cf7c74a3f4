use std::time::Duration;

use tracing::info;

use crate::bundle::{BundleScripts, ServerBundle};
use crate::env::{ChildEnvironment, EnvironmentBuilder};
use crate::error::Result;
use crate::installer::RuntimeCache;
use crate::platform::PlatformProfile;
use crate::runner::CommandRunner;
use crate::signal::{Shutdown, SignalBridge, DEFAULT_CHILD_POLL};
use crate::supervisor::{ProcessSupervisor, DEFAULT_KILL_GRACE};

pub const STUDIO_PORT: u16 = 56765;

/// Argument the server script expects to start the studio app.
pub const SERVER_MODE_ARG: &str = "studio";

#[derive(Debug, Clone)]
pub struct StudioOptions {
    pub port: u16,
    pub kill_grace: Duration,
    pub child_poll: Duration,
    /// Extra variables for every child, applied over the runtime defaults.
    pub env: Vec<(String, String)>,
}

impl Default for StudioOptions {
    fn default() -> Self {
        Self {
            port: STUDIO_PORT,
            kill_grace: DEFAULT_KILL_GRACE,
            child_poll: DEFAULT_CHILD_POLL,
            env: Vec::new(),
        }
    }
}

pub struct Studio<C> {
    cache: C,
    profile: PlatformProfile,
    bundle: ServerBundle,
    opts: StudioOptions,
}

impl<C: RuntimeCache> Studio<C> {
    pub fn new(cache: C, profile: PlatformProfile, bundle: ServerBundle, opts: StudioOptions) -> Self {
        Self {
            cache,
            profile,
            bundle,
            opts,
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn bundle(&self) -> &ServerBundle {
        &self.bundle
    }

    pub fn environment(&self) -> ChildEnvironment {
        EnvironmentBuilder::new(&self.profile, self.cache.layout())
            .overrides(self.opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .build()
    }

    /// Installs the runtime if needed and returns a runner bound to it.
    pub fn runner(&self) -> Result<CommandRunner> {
        self.cache.ensure_installed()?;
        Ok(CommandRunner::new(self.cache.layout(), self.environment()))
    }

    /// Everything up to, not including, the migration step.
    pub fn prepare(&self) -> Result<(CommandRunner, BundleScripts)> {
        let runner = self.runner()?;
        self.bundle.ensure_dependencies(&runner)?;
        let scripts = self.bundle.locate()?;
        Ok((runner, scripts))
    }

    /// install → dependencies → migrate → launch → wait.
    pub fn run(&self) -> Result<Shutdown> {
        let (runner, scripts) = self.prepare()?;

        info!(script = %scripts.migrate.display(), "running migrations");
        runner.run_script(&scripts.migrate, std::iter::empty::<&str>())?;

        let mut bridge = SignalBridge::install()?;
        let port = self.opts.port.to_string();
        let server = runner.with_env(&[("PORT", port.as_str())]);
        let mut supervisor =
            ProcessSupervisor::new(self.profile.kill_strategy).with_grace(self.opts.kill_grace);
        supervisor.start_script(&server, &scripts.server, [SERVER_MODE_ARG])?;
        info!(url = %format!("http://localhost:{port}"), "studio is running");

        let shutdown = bridge.wait(&mut supervisor, self.opts.child_poll)?;
        match shutdown {
            Shutdown::Signal => info!("studio stopped"),
            Shutdown::ChildExited(code) => info!(code, "studio server exited"),
        }
        Ok(shutdown)
    }
}
