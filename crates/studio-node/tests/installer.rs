use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use url::Url;

use studio_node::fetch::{hex_lower, Downloaded};
use studio_node::{
    Arch, Error, Fetcher, HttpFetcher, InstallLayout, InstallOptions, InstallOutcome, LockOptions,
    Platform, PlatformProfile, RuntimeCache, RuntimeInstaller, RuntimeSpec,
};

const VERSION: &str = "22.9.0";

const FAKE_NODE: &str = "#!/bin/sh\n\
if [ \"$1\" = \"-e\" ]; then shift; eval \"$1\"; exit $?; fi\n\
exec /bin/sh \"$@\"\n";
const FAKE_NPM: &str = "#!/bin/sh\necho npm \"$@\"\n";

fn linux_spec() -> RuntimeSpec {
    RuntimeSpec::new(VERSION, PlatformProfile::new(Platform::Linux, Arch::X64).unwrap()).unwrap()
}

fn tar_gz(entries: &[(String, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        // Deliberately not executable: the installer must fix modes.
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn runtime_archive(spec: &RuntimeSpec) -> Vec<u8> {
    let root = spec.dist_name();
    tar_gz(&[
        (format!("{root}/bin/node"), FAKE_NODE.as_bytes()),
        (format!("{root}/bin/npm"), FAKE_NPM.as_bytes()),
        (format!("{root}/lib/node_modules/npm/package.json"), b"{}"),
    ])
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

/// Lays out `<dist>/v<version>/{archive,SHASUMS256.txt}` and returns the dist URL.
fn publish(dist: &Path, spec: &RuntimeSpec, archive: &[u8], listed_sha: &str) -> String {
    let dir = dist.join(format!("v{}", spec.version()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(spec.archive_file_name()), archive).unwrap();
    std::fs::write(
        dir.join("SHASUMS256.txt"),
        format!(
            "{}  node-v{VERSION}-darwin-arm64.tar.gz\n{listed_sha}  {}\n",
            "0".repeat(64),
            spec.archive_file_name()
        ),
    )
    .unwrap();
    Url::from_directory_path(dist)
        .unwrap()
        .as_str()
        .trim_end_matches('/')
        .to_string()
}

fn options(dist_url: String) -> InstallOptions {
    InstallOptions {
        dist_url,
        verify_checksums: true,
        lock: LockOptions {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            stale_after: None,
        },
        download_timeout: Some(Duration::from_secs(30)),
    }
}

fn assert_no_leftovers(layout: &InstallLayout, spec: &RuntimeSpec) {
    assert!(!layout.lock_path().exists(), "lock left behind");
    assert!(!layout.archive_path(spec).exists(), "archive left behind");
    let staging: Vec<PathBuf> = std::fs::read_dir(&layout.base_dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(".staging-"))
        .collect();
    assert!(staging.is_empty(), "staging left behind: {staging:?}");
}

struct CountingFetcher {
    inner: HttpFetcher,
    downloads: Arc<AtomicUsize>,
}

impl Fetcher for CountingFetcher {
    fn fetch_to(&self, url: &str, dest: &Path) -> studio_node::Result<Downloaded> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which other installers contend for the lock.
        std::thread::sleep(Duration::from_millis(100));
        self.inner.fetch_to(url, dest)
    }

    fn fetch_text(&self, url: &str) -> studio_node::Result<String> {
        self.inner.fetch_text(url)
    }
}

#[test]
fn fresh_install_then_already_installed() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));
    let base = tmp.path().join("cache");

    let installer = RuntimeInstaller::new(spec.clone(), &base, options(dist));
    assert!(!installer.is_installed());

    match installer.ensure_installed().unwrap() {
        InstallOutcome::Installed { bytes, sha256 } => {
            assert_eq!(bytes, archive.len() as u64);
            assert_eq!(sha256, sha256_hex(&archive));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let layout = installer.layout();
    assert!(layout.binary_path.ends_with("node-22.9.0/bin/node"));
    assert!(layout.is_installed());
    assert!(layout.module_dir.join("npm/package.json").is_file());
    assert_no_leftovers(layout, &spec);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        for bin in [&layout.binary_path, &layout.package_manager_binary_path] {
            let mode = std::fs::metadata(bin).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755, "{}", bin.display());
        }
    }

    assert_eq!(
        installer.ensure_installed().unwrap(),
        InstallOutcome::AlreadyInstalled
    );
}

#[test]
fn concurrent_installers_download_once() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));
    let base = tmp.path().join("cache");

    const N: usize = 6;
    let downloads = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(N));
    let handles: Vec<_> = (0..N)
        .map(|_| {
            let installer = RuntimeInstaller::with_fetcher(
                spec.clone(),
                &base,
                options(dist.clone()),
                CountingFetcher {
                    inner: HttpFetcher::default(),
                    downloads: Arc::clone(&downloads),
                },
            );
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                installer.ensure_installed()
            })
        })
        .collect();

    let outcomes: Vec<InstallOutcome> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(downloads.load(Ordering::SeqCst), 1);
    let installed = outcomes
        .iter()
        .filter(|o| matches!(o, InstallOutcome::Installed { .. }))
        .count();
    assert_eq!(installed, 1, "{outcomes:?}");

    let layout = InstallLayout::new(&spec, &base);
    assert!(layout.is_installed());
    assert_no_leftovers(&layout, &spec);
}

#[test]
fn partial_install_is_replaced() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));
    let base = tmp.path().join("cache");

    // Interrupted earlier run: interpreter present, package manager missing.
    let layout = InstallLayout::new(&spec, &base);
    std::fs::create_dir_all(&layout.bin_dir).unwrap();
    std::fs::write(&layout.binary_path, b"truncated").unwrap();
    std::fs::write(layout.versioned_dir.join("junk"), b"x").unwrap();
    std::fs::create_dir_all(base.join(".staging-dead/whatever")).unwrap();

    let installer = RuntimeInstaller::new(spec.clone(), &base, options(dist));
    assert!(!installer.is_installed());
    assert!(matches!(
        installer.ensure_installed().unwrap(),
        InstallOutcome::Installed { .. }
    ));
    assert_eq!(std::fs::read(&layout.binary_path).unwrap(), FAKE_NODE.as_bytes());
    assert!(!layout.versioned_dir.join("junk").exists());
    assert_no_leftovers(&layout, &spec);
}

#[test]
fn checksum_mismatch_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &"f".repeat(64));
    let base = tmp.path().join("cache");

    let installer = RuntimeInstaller::new(spec.clone(), &base, options(dist));
    let err = installer.ensure_installed().unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }), "{err}");
    assert_eq!(err.code(), "CHECKSUM_MISMATCH");

    let layout = installer.layout();
    assert!(!layout.versioned_dir.exists());
    assert_no_leftovers(layout, &spec);
}

#[test]
fn checksum_verification_can_be_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &"f".repeat(64));

    let mut opts = options(dist);
    opts.verify_checksums = false;
    let installer = RuntimeInstaller::new(spec, &tmp.path().join("cache"), opts);
    installer.ensure_installed().unwrap();
    assert!(installer.is_installed());
}

#[test]
fn corrupt_archive_is_an_extraction_error() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = b"this is not a gzip stream".to_vec();
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));

    let installer = RuntimeInstaller::new(spec.clone(), &tmp.path().join("cache"), options(dist));
    let err = installer.ensure_installed().unwrap_err();
    assert!(matches!(err, Error::Extraction { .. }), "{err}");
    assert!(!installer.layout().versioned_dir.exists());
    assert_no_leftovers(installer.layout(), &spec);
}

#[test]
fn archive_missing_package_manager_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = tar_gz(&[(
        format!("{}/bin/node", spec.dist_name()),
        FAKE_NODE.as_bytes(),
    )]);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));

    let installer = RuntimeInstaller::new(spec.clone(), &tmp.path().join("cache"), options(dist));
    let err = installer.ensure_installed().unwrap_err();
    assert!(matches!(err, Error::Extraction { .. }), "{err}");
    assert!(!installer.is_installed());
    assert!(!installer.layout().versioned_dir.exists());
}

#[test]
fn missing_archive_is_a_download_error() {
    let tmp = tempfile::tempdir().unwrap();
    let dist = Url::from_directory_path(tmp.path()).unwrap().to_string();

    let installer = RuntimeInstaller::new(linux_spec(), &tmp.path().join("cache"), options(dist));
    let err = installer.ensure_installed().unwrap_err();
    assert!(matches!(err, Error::Download { .. }), "{err}");
    assert!(err.is_retryable());
    assert!(!installer.layout().lock_path().exists());
}

#[test]
fn held_lock_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let base = tmp.path().join("cache");
    let layout = InstallLayout::new(&spec, &base);
    std::fs::create_dir_all(&base).unwrap();
    // Live owner, no age limit: never reclaimed.
    std::fs::write(layout.lock_path(), format!("pid={}\n", std::process::id())).unwrap();

    let mut opts = options("file:///nonexistent".to_string());
    opts.lock.timeout = Duration::from_millis(200);
    let installer = RuntimeInstaller::new(spec, &base, opts);
    let err = installer.ensure_installed().unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }), "{err}");
    assert!(layout.lock_path().exists());
}

fn serve_once(body: Vec<u8>) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        for _ in 0..64 {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\n\
Content-Type: application/gzip\r\n\
Content-Length: {}\r\n\
Connection: close\r\n\
\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).expect("write head");
        stream.write_all(&body).expect("write body");
        let _ = stream.flush();
    });

    format!("http://{addr}")
}

#[test]
fn installs_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let dist = serve_once(runtime_archive(&spec));

    let mut opts = options(dist);
    // The one-shot server answers a single request.
    opts.verify_checksums = false;
    let installer = RuntimeInstaller::new(spec.clone(), &tmp.path().join("cache"), opts);
    installer.ensure_installed().unwrap();
    assert!(installer.is_installed());
    assert_no_leftovers(installer.layout(), &spec);
}

#[cfg(unix)]
#[test]
fn installed_runtime_runs_and_supervises_scripts() {
    use studio_node::env::EnvironmentBuilder;
    use studio_node::{ChildStatus, CommandRunner, ProcessSupervisor};

    let tmp = tempfile::tempdir().unwrap();
    let spec = linux_spec();
    let archive = runtime_archive(&spec);
    let dist = publish(&tmp.path().join("dist"), &spec, &archive, &sha256_hex(&archive));
    let installer = RuntimeInstaller::new(spec.clone(), &tmp.path().join("cache"), options(dist));
    installer.ensure_installed().unwrap();

    let layout = installer.layout();
    let env = EnvironmentBuilder::new(spec.profile(), layout).build();
    let runner = CommandRunner::new(layout, env);

    runner.run_code("test -n \"$NODE_PATH\"").unwrap();
    runner.npm(["--version"], None).unwrap();

    let out = tmp.path().join("out.txt");
    let script = tmp.path().join("hello.js");
    std::fs::write(&script, format!("echo ok > '{}'\n", out.display())).unwrap();

    let mut sup = ProcessSupervisor::new(spec.profile().kill_strategy);
    sup.start_script(&runner, &script, std::iter::empty::<&str>())
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let code = loop {
        match sup.poll().unwrap() {
            ChildStatus::Exited(code) => break code,
            _ if std::time::Instant::now() > deadline => panic!("script did not exit"),
            _ => std::thread::sleep(Duration::from_millis(20)),
        }
    };
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "ok\n");
}
