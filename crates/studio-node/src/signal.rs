//! Races termination signals against the supervised child.
//!
//! On Unix `SIGINT`, `SIGTERM` and `SIGQUIT` are handled; elsewhere only
//! Ctrl-C. Handlers are registered by [`SignalBridge::install`], which must
//! happen before the child is launched so no signal slips through between
//! spawn and wait.

use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::supervisor::ProcessSupervisor;

pub const DEFAULT_CHILD_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// A termination signal arrived and the child's group was killed.
    Signal,
    /// The child exited on its own with this code.
    ChildExited(i32),
}

pub struct SignalBridge {
    rt: Runtime,
    listener: Listener,
}

impl SignalBridge {
    pub fn install() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| Error::Signal { source })?;
        let listener = {
            let _guard = rt.enter();
            Listener::register().map_err(|source| Error::Signal { source })?
        };
        debug!("termination signal handlers installed");
        Ok(Self { rt, listener })
    }

    /// Blocks until either a termination signal arrives or the child exits.
    pub fn wait(&mut self, supervisor: &mut ProcessSupervisor, poll: Duration) -> Result<Shutdown> {
        let Self { rt, listener } = self;
        let exited: Option<i32> = rt.block_on(async {
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    name = listener.recv() => {
                        info!(signal = name, "termination signal received");
                        return Ok::<_, Error>(None);
                    }
                    _ = tick.tick() => {
                        if let Some(code) = supervisor.reap()? {
                            return Ok(Some(code));
                        }
                    }
                }
            }
        })?;

        match exited {
            Some(code) => Ok(Shutdown::ChildExited(code)),
            None => {
                supervisor.kill()?;
                Ok(Shutdown::Signal)
            }
        }
    }
}

#[cfg(unix)]
struct Listener {
    int: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listener {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.int.recv() => "SIGINT",
            _ = self.term.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
struct Listener;

#[cfg(not(unix))]
impl Listener {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
