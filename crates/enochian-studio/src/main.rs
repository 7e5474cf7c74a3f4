use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use studio_node::{
    CommandRunner, InstallOutcome, PlatformProfile, RuntimeCache, RuntimeInstaller, RuntimeSpec,
    ServerBundle, Shutdown, Studio,
};
use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod report;

use config::{Overrides, Settings};
use report::{
    write_json_stdout, ErrorReport, InstallReport, PathsReport, Reporter, INSTALL_SCHEMA_VERSION,
    PATHS_SCHEMA_VERSION,
};

const LOG_ENV: &str = "ENOCHIAN_STUDIO_LOG";

#[derive(Debug, Parser)]
#[command(name = "enochian-studio")]
#[command(about = "Run the enochian studio on a managed Node.js runtime.", long_about = None)]
struct Cli {
    /// State directory (default: $ENOCHIAN_STUDIO_ROOT or ~/.enochian-studio).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default: $ENOCHIAN_STUDIO_CONFIG or <root>/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    node_version: Option<String>,

    #[arg(long, global = true)]
    dist_url: Option<String>,

    /// Skip SHASUMS256.txt verification of the runtime archive.
    #[arg(long, global = true)]
    no_verify: bool,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install everything needed, migrate, and serve until interrupted (default).
    Run(RunArgs),
    /// Make sure the Node.js runtime is in the cache.
    Install,
    /// Print the resolved locations without touching anything.
    Paths,
    /// Run npm from the managed runtime in the current directory.
    Npm {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Evaluate inline JavaScript with the managed runtime.
    Eval { code: String },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    bundle_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let cmd = cli.cmd.unwrap_or_else(|| Command::Run(RunArgs::default()));
    let (port, bundle_dir) = match &cmd {
        Command::Run(args) => (args.port, args.bundle_dir.clone()),
        _ => (None, None),
    };
    let flags = Overrides {
        root: cli.root,
        config: cli.config,
        node_version: cli.node_version,
        dist_url: cli.dist_url,
        port,
        bundle_dir,
        no_verify: cli.no_verify,
    };
    let settings = Settings::resolve(&flags, |k| std::env::var_os(k))?;
    debug!(root = %settings.root.display(), config = %settings.config_path.display(), "settings resolved");

    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cmd {
        Command::Run(_) => cmd_run(&settings, &reporter),
        Command::Install => cmd_install(&settings, &reporter),
        Command::Paths => cmd_paths(&settings, &reporter),
        Command::Npm { args } => cmd_npm(&settings, &args, &reporter),
        Command::Eval { code } => cmd_eval(&settings, &code, &reporter),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = std::env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(format!("studio_node={level},enochian_studio={level}")));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .init();
}

fn installer(settings: &Settings) -> studio_node::Result<(PlatformProfile, RuntimeInstaller)> {
    let profile = PlatformProfile::host()?;
    let spec = RuntimeSpec::new(&settings.node_version, profile)?;
    Ok((
        profile,
        RuntimeInstaller::new(spec, &settings.cache_dir, settings.install.clone()),
    ))
}

fn runner(settings: &Settings) -> studio_node::Result<CommandRunner> {
    let (profile, installer) = installer(settings)?;
    let studio = Studio::new(
        installer,
        profile,
        ServerBundle::new(&settings.bundle_dir),
        settings.studio_options(),
    );
    studio.runner()
}

/// Exit status for a failed library call: the child's own code when a
/// command ran and failed, 1 otherwise.
fn failure_code(err: &studio_node::Error, pass_through: bool) -> ExitCode {
    match err {
        studio_node::Error::CommandFailed { code, .. } if pass_through => child_exit(*code),
        _ => ExitCode::from(1),
    }
}

fn child_exit(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::from(1))
}

fn cmd_run(settings: &Settings, reporter: &Reporter) -> Result<ExitCode> {
    let (profile, installer) = match installer(settings) {
        Ok(v) => v,
        Err(err) => {
            reporter.failure(&err);
            return Ok(ExitCode::from(1));
        }
    };
    let studio = Studio::new(
        installer,
        profile,
        ServerBundle::new(&settings.bundle_dir),
        settings.studio_options(),
    );
    match studio.run() {
        Ok(Shutdown::Signal) => Ok(ExitCode::SUCCESS),
        Ok(Shutdown::ChildExited(code)) => Ok(child_exit(code)),
        Err(err) => {
            reporter.failure(&err);
            if reporter.json {
                write_json_stdout(&ErrorReport::from_error(&err))?;
            }
            Ok(failure_code(&err, false))
        }
    }
}

fn cmd_install(settings: &Settings, reporter: &Reporter) -> Result<ExitCode> {
    let mut report = InstallReport {
        schema_version: INSTALL_SCHEMA_VERSION,
        ok: false,
        root: settings.root.display().to_string(),
        node_version: settings.node_version.clone(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        dir: String::new(),
        outcome: None,
        bytes: None,
        sha256: None,
        error: None,
    };

    let result = installer(settings).and_then(|(profile, installer)| {
        report.platform = profile.platform.to_string();
        report.arch = profile.arch.to_string();
        report.node_version = installer.spec().version().to_string();
        report.dir = installer.layout().versioned_dir.display().to_string();
        installer.ensure_installed()
    });

    let code = match result {
        Ok(outcome) => {
            report.ok = true;
            match outcome {
                InstallOutcome::AlreadyInstalled => {
                    report.outcome = Some("already_installed");
                    reporter.line(&format!("node {} already installed in {}", report.node_version, report.dir));
                }
                InstallOutcome::Installed { bytes, sha256 } => {
                    report.outcome = Some("installed");
                    reporter.line(&format!("installed node {} into {}", report.node_version, report.dir));
                    report.bytes = Some(bytes);
                    report.sha256 = Some(sha256);
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            reporter.failure(&err);
            report.error = Some(ErrorReport::from_error(&err));
            failure_code(&err, false)
        }
    };

    if reporter.json {
        write_json_stdout(&report)?;
    }
    Ok(code)
}

fn cmd_paths(settings: &Settings, reporter: &Reporter) -> Result<ExitCode> {
    let (profile, installer) = match installer(settings) {
        Ok(v) => v,
        Err(err) => {
            reporter.failure(&err);
            if reporter.json {
                write_json_stdout(&ErrorReport::from_error(&err))?;
            }
            return Ok(ExitCode::from(1));
        }
    };
    let layout = installer.layout();
    let bundle = ServerBundle::new(&settings.bundle_dir);
    let report = PathsReport {
        schema_version: PATHS_SCHEMA_VERSION,
        ok: true,
        root: display(&settings.root),
        config: display(&settings.config_path),
        cache_dir: display(&settings.cache_dir),
        node_version: installer.spec().version().to_string(),
        platform: profile.platform.to_string(),
        arch: profile.arch.to_string(),
        install_dir: display(&layout.versioned_dir),
        node: display(&layout.binary_path),
        npm: display(&layout.package_manager_binary_path),
        module_dir: display(&layout.module_dir),
        lock: display(&layout.lock_path()),
        download_url: installer.download_url(),
        installed: installer.is_installed(),
        bundle_dir: display(bundle.dir()),
        migrate_script: display(&bundle.migrate_script()),
        server_script: display(&bundle.server_script()),
    };

    if reporter.json {
        write_json_stdout(&report)?;
    } else {
        for (k, v) in [
            ("root", &report.root),
            ("config", &report.config),
            ("node", &report.node),
            ("npm", &report.npm),
            ("modules", &report.module_dir),
            ("download", &report.download_url),
            ("bundle", &report.bundle_dir),
        ] {
            reporter.line(&format!("{k}: {v}"));
        }
        reporter.line(&format!("installed: {}", report.installed));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_npm(settings: &Settings, args: &[String], reporter: &Reporter) -> Result<ExitCode> {
    let cwd = std::env::current_dir().ok();
    let result = runner(settings).and_then(|r| r.npm(args, cwd.as_deref()));
    Ok(match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            reporter.failure(&err);
            failure_code(&err, true)
        }
    })
}

fn cmd_eval(settings: &Settings, code: &str, reporter: &Reporter) -> Result<ExitCode> {
    let result = runner(settings).and_then(|r| r.run_code(code));
    Ok(match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            reporter.failure(&err);
            failure_code(&err, true)
        }
    })
}

fn display(p: &Path) -> String {
    p.display().to_string()
}
