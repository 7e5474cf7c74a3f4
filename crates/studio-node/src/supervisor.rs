use std::ffi::OsStr;
use std::path::Path;
use std::process::Child;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::env::ChildEnvironment;
use crate::error::{Error, Result};
use crate::platform::KillStrategy;
use crate::runner::{exit_code, CommandRunner};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

const EXIT_POLL: Duration = Duration::from_millis(25);

/// A detached child owned by exactly one [`ProcessSupervisor`].
#[derive(Debug)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub process_group_id: u32,
    pub command_line: Vec<String>,
    pub environment: ChildEnvironment,
    pub(crate) child: Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Terminating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    NotStarted,
    Running,
    Exited(i32),
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    state: SupervisorState,
    process: Option<SupervisedProcess>,
    exit: Option<i32>,
    kill_strategy: KillStrategy,
    grace: Duration,
    group_swept: bool,
}

impl ProcessSupervisor {
    pub fn new(kill_strategy: KillStrategy) -> Self {
        Self {
            state: SupervisorState::NotStarted,
            process: None,
            exit: None,
            kill_strategy,
            grace: DEFAULT_KILL_GRACE,
            group_swept: false,
        }
    }

    /// How long `kill` waits after the polite signal before forcing.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn process(&self) -> Option<&SupervisedProcess> {
        self.process.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    pub fn start<I, S>(&mut self, runner: &CommandRunner, program: &Path, args: I) -> Result<u32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_not_started()?;
        let process = runner.launch(program, args)?;
        Ok(self.adopt(process))
    }

    pub fn start_script<I, S>(&mut self, runner: &CommandRunner, script: &Path, args: I) -> Result<u32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_not_started()?;
        let process = runner.launch_script(script, args)?;
        Ok(self.adopt(process))
    }

    fn ensure_not_started(&self) -> Result<()> {
        match (&self.state, &self.process) {
            (SupervisorState::NotStarted, _) => Ok(()),
            (_, Some(p)) => Err(Error::AlreadyRunning { pid: p.pid }),
            (_, None) => Err(Error::AlreadyRunning { pid: 0 }),
        }
    }

    fn adopt(&mut self, process: SupervisedProcess) -> u32 {
        let pid = process.pid;
        self.process = Some(process);
        self.state = SupervisorState::Running;
        pid
    }

    /// Non-blocking status check; never changes [`SupervisorState`].
    pub fn poll(&mut self) -> Result<ChildStatus> {
        if let Some(code) = self.exit {
            return Ok(ChildStatus::Exited(code));
        }
        let Some(process) = self.process.as_mut() else {
            return Ok(ChildStatus::NotStarted);
        };
        match process
            .child
            .try_wait()
            .map_err(|e| Error::io(format!("try_wait pid {}", process.pid), e))?
        {
            Some(status) => {
                let code = exit_code(&status);
                self.exit = Some(code);
                Ok(ChildStatus::Exited(code))
            }
            None => Ok(ChildStatus::Running),
        }
    }

    /// Moves a child that exited on its own to `Stopped`.
    pub fn reap(&mut self) -> Result<Option<i32>> {
        match self.poll()? {
            ChildStatus::Exited(code) => {
                if self.state != SupervisorState::Stopped {
                    info!(pid = ?self.pid(), code, "server exited");
                    self.state = SupervisorState::Stopped;
                }
                Ok(Some(code))
            }
            ChildStatus::NotStarted | ChildStatus::Running => Ok(None),
        }
    }

    /// Blocks until the child exits on its own.
    pub fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.reap()? {
            return Ok(code);
        }
        let Some(process) = self.process.as_mut() else {
            return Ok(0);
        };
        let status = process
            .child
            .wait()
            .map_err(|e| Error::io(format!("wait pid {}", process.pid), e))?;
        let code = exit_code(&status);
        self.exit = Some(code);
        self.state = SupervisorState::Stopped;
        Ok(code)
    }

    /// Terminates the child's whole process group. Calling it again, or
    /// after the child already exited, is a no-op.
    pub fn kill(&mut self) -> Result<()> {
        match self.state {
            SupervisorState::NotStarted => return Ok(()),
            SupervisorState::Stopped => return self.sweep_group(),
            SupervisorState::Running | SupervisorState::Terminating => {}
        }
        if self.reap()?.is_some() {
            return self.sweep_group();
        }
        self.state = SupervisorState::Terminating;
        let Some(process) = self.process.as_mut() else {
            self.state = SupervisorState::Stopped;
            return Ok(());
        };
        info!(pid = process.pid, "stopping server");

        match self.kill_strategy {
            KillStrategy::ProcessGroup => {
                signal_group(process.process_group_id, Signal::Term)?;
                let deadline = Instant::now() + self.grace;
                let mut exited = false;
                while Instant::now() < deadline {
                    if process
                        .child
                        .try_wait()
                        .map_err(|e| Error::io(format!("try_wait pid {}", process.pid), e))?
                        .is_some()
                    {
                        exited = true;
                        break;
                    }
                    std::thread::sleep(EXIT_POLL);
                }
                if !exited {
                    warn!(pid = process.pid, grace = ?self.grace, "server ignored SIGTERM; killing");
                    signal_group(process.process_group_id, Signal::Kill)?;
                }
            }
            KillStrategy::TreeKill => {
                tree_kill(process.pid);
                if let Err(err) = process.child.kill() {
                    debug!(pid = process.pid, "child.kill after tree kill: {err}");
                }
            }
        }

        let status = process
            .child
            .wait()
            .map_err(|e| Error::io(format!("wait pid {}", process.pid), e))?;
        let code = exit_code(&status);
        debug!(pid = process.pid, code, "server stopped");
        self.exit = Some(code);
        self.state = SupervisorState::Stopped;
        self.sweep_group()
    }

    /// Kills group members that outlived the leader. Runs once per child so a
    /// recycled group id is never signalled later.
    fn sweep_group(&mut self) -> Result<()> {
        if self.group_swept || self.kill_strategy != KillStrategy::ProcessGroup {
            return Ok(());
        }
        let Some(process) = self.process.as_ref() else {
            return Ok(());
        };
        self.group_swept = true;
        signal_group(process.process_group_id, Signal::Kill)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            warn!("stop server on drop: {err}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, sig: Signal) -> Result<()> {
    let Ok(pgid) = i32::try_from(pgid) else {
        return Ok(());
    };
    if pgid <= 0 {
        return Ok(());
    }
    let signo = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if unsafe { libc::kill(-pgid, signo) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(Error::io(format!("kill process group {pgid} ({sig:?})"), err))
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _sig: Signal) -> Result<()> {
    Ok(())
}

fn tree_kill(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => debug!(pid, "taskkill exited with {s}"),
        Err(err) => debug!(pid, "taskkill: {err}"),
    }
}
