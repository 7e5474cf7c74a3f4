use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info};

use crate::env::ChildEnvironment;
use crate::error::{Error, Result};
use crate::paths::InstallLayout;
use crate::supervisor::SupervisedProcess;

/// Runs programs through the installed runtime with a fixed environment.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    node: PathBuf,
    npm: PathBuf,
    env: ChildEnvironment,
}

impl CommandRunner {
    pub fn new(layout: &InstallLayout, env: ChildEnvironment) -> Self {
        Self {
            node: layout.binary_path.clone(),
            npm: layout.package_manager_binary_path.clone(),
            env,
        }
    }

    pub fn node(&self) -> &Path {
        &self.node
    }

    pub fn npm_path(&self) -> &Path {
        &self.npm
    }

    pub fn env(&self) -> &ChildEnvironment {
        &self.env
    }

    /// Same runner with extra variables layered on top.
    pub fn with_env(&self, extra: &[(&str, &str)]) -> Self {
        let mut env = self.env.clone();
        for (k, v) in extra {
            env.insert(*k, *v);
        }
        Self {
            node: self.node.clone(),
            npm: self.npm.clone(),
            env,
        }
    }

    fn command<I, S>(&self, program: &Path, args: I, cwd: Option<&Path>) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.env.apply_to(&mut cmd);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Blocks until `program` exits; a non-zero exit is an error.
    pub fn run_sync<I, S>(&self, program: &Path, args: I, cwd: Option<&Path>) -> Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(program, args, cwd);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        debug!(command = %render_command(&cmd), "run");
        let status = cmd.status().map_err(|source| Error::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        if !status.success() {
            return Err(Error::CommandFailed {
                program: program.display().to_string(),
                code: exit_code(&status),
            });
        }
        Ok(status)
    }

    /// Starts `program` in its own process group and returns without waiting.
    pub fn launch<I, S>(&self, program: &Path, args: I) -> Result<SupervisedProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(program, args, None);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        detach_process_group(&mut cmd);

        let command_line = command_line(&cmd);
        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(pid, command = %command_line.join(" "), "launched");

        Ok(SupervisedProcess {
            pid,
            process_group_id: pid,
            command_line,
            environment: self.env.clone(),
            child,
        })
    }

    pub fn run_script<I, S>(&self, script: &Path, args: I) -> Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = std::iter::once(script.as_os_str().to_os_string())
            .chain(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self.run_sync(&self.node, argv, None)
    }

    pub fn launch_script<I, S>(&self, script: &Path, args: I) -> Result<SupervisedProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = std::iter::once(script.as_os_str().to_os_string())
            .chain(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self.launch(&self.node, argv)
    }

    /// `node -e <code>`
    pub fn run_code(&self, code: &str) -> Result<ExitStatus> {
        self.run_sync(&self.node, ["-e", code], None)
    }

    pub fn npm<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_sync(&self.npm, args, cwd)
    }
}

#[cfg(unix)]
fn detach_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach_process_group(cmd: &mut Command) {
    use std::os::windows::process::CommandExt as _;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach_process_group(_cmd: &mut Command) {}

/// Exit code, with signal deaths mapped to `128 + signo`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    }
}

fn command_line(cmd: &Command) -> Vec<String> {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect()
}

fn render_command(cmd: &Command) -> String {
    command_line(cmd).join(" ")
}
