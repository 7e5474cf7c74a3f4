use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Age after which a lock is reclaimed when its owner cannot be checked:
    /// no pid recorded, or no liveness check on this platform. A lock whose
    /// recorded owner is alive is never reclaimed.
    pub stale_after: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            stale_after: Some(Duration::from_secs(600)),
        }
    }
}

/// Ownership of a lock file created with `create_new`.
///
/// The file is removed by [`LockHandle::release`] or when the handle is
/// dropped, so an error or panic inside the protected section still frees
/// the lock for the next invocation.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "lock released");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(
                format!("remove lock {}", self.path.display()),
                err,
            )),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("{err}");
        }
    }
}

pub fn acquire(path: &Path, timeout: Duration, poll_interval: Duration) -> Result<LockHandle> {
    acquire_with(
        path,
        LockOptions {
            timeout,
            poll_interval,
            ..LockOptions::default()
        },
    )
}

pub fn acquire_with(path: &Path, opts: LockOptions) -> Result<LockHandle> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("create_dir_all {}", parent.display()), e))?;
    }

    let start = Instant::now();
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut f) => {
                let owner = format!(
                    "pid={}\ncreated_unix_ms={}\n",
                    std::process::id(),
                    now_unix_ms()
                );
                let handle = LockHandle {
                    path: path.to_path_buf(),
                    released: false,
                };
                f.write_all(owner.as_bytes())
                    .map_err(|e| Error::io(format!("write lock {}", path.display()), e))?;
                debug!(path = %path.display(), "lock acquired");
                return Ok(handle);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(Error::io(format!("create lock {}", path.display()), err));
            }
        }

        if reclaim_if_stale(path, opts.stale_after) {
            continue;
        }

        let waited = start.elapsed();
        if waited >= opts.timeout {
            return Err(Error::LockTimeout {
                path: path.to_path_buf(),
                waited,
            });
        }
        debug!(path = %path.display(), ?waited, "lock busy; waiting");
        std::thread::sleep(opts.poll_interval.min(opts.timeout - waited));
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LockOwner {
    pid: Option<u32>,
    created_unix_ms: Option<u64>,
}

fn parse_owner(contents: &str) -> LockOwner {
    let mut owner = LockOwner::default();
    for line in contents.lines() {
        if let Some((k, v)) = line.split_once('=') {
            match k.trim() {
                "pid" => owner.pid = v.trim().parse().ok(),
                "created_unix_ms" => owner.created_unix_ms = v.trim().parse().ok(),
                _ => {}
            }
        }
    }
    owner
}

fn reclaim_if_stale(path: &Path, stale_after: Option<Duration>) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        // Vanished between create and read: just retry.
        return !path.exists();
    };
    let owner = parse_owner(&contents);

    let alive = owner.pid.and_then(pid_alive);
    let age = lock_age(path, &owner);
    let stale = match alive {
        Some(alive) => !alive,
        None => matches!((stale_after, age), (Some(max), Some(age)) if age >= max),
    };
    if !stale {
        return false;
    }

    let dead_owner = alive == Some(false);
    warn!(
        path = %path.display(),
        pid = ?owner.pid,
        ?age,
        dead_owner,
        "reclaiming stale lock"
    );
    remove_if_unchanged(path, &contents)
}

/// Removes the lock at `path` only if it still holds `expected`.
///
/// The file is renamed aside first and compared there, so a lock written by
/// a new owner in the meantime is put back instead of deleted. Returns
/// whether the caller should retry creating the lock.
fn remove_if_unchanged(path: &Path, expected: &str) -> bool {
    match std::fs::read_to_string(path) {
        Ok(again) if again == expected => {}
        Ok(_) => return false,
        Err(err) => return err.kind() == std::io::ErrorKind::NotFound,
    }

    let aside = aside_path(path);
    if let Err(err) = std::fs::rename(path, &aside) {
        return err.kind() == std::io::ErrorKind::NotFound;
    }
    let moved = std::fs::read_to_string(&aside);
    let unchanged = matches!(&moved, Ok(m) if m == expected);
    if !unchanged {
        // hard_link never replaces a lock created since the rename.
        let restored = std::fs::hard_link(&aside, path).or_else(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                Err(err)
            } else {
                std::fs::rename(&aside, path)
            }
        });
        if let Err(err) = restored {
            warn!(path = %path.display(), "restore lock moved aside: {err}");
        }
    }
    match std::fs::remove_file(&aside) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %aside.display(), "remove reclaimed lock: {err}"),
    }
    unchanged
}

fn aside_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".stale-{}-{n}", std::process::id()));
    path.with_file_name(name)
}

fn lock_age(path: &Path, owner: &LockOwner) -> Option<Duration> {
    if let Some(created) = owner.created_unix_ms {
        return Some(Duration::from_millis(now_unix_ms().saturating_sub(created)));
    }
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// `None` when liveness cannot be determined.
fn pid_alive(pid: u32) -> Option<bool> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).ok().filter(|p| *p > 0)?;
        if unsafe { libc::kill(pid, 0) } == 0 {
            return Some(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Some(false),
            Some(libc::EPERM) => Some(true),
            _ => None,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            stale_after: None,
        }
    }

    #[test]
    fn acquire_writes_owner_and_release_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.lock");

        let mut handle = acquire_with(&path, quick()).unwrap();
        let owner = parse_owner(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(owner.pid, Some(std::process::id()));
        assert!(owner.created_unix_ms.is_some());

        handle.release().unwrap();
        assert!(!path.exists());
        // Second release is a no-op.
        handle.release().unwrap();
        assert!(handle.is_released());
    }

    #[test]
    fn drop_releases_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("b.lock");
        {
            let _h = acquire_with(&path, quick()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _again = acquire_with(&path, quick()).unwrap();
    }

    #[test]
    fn held_lock_times_out_within_one_poll_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.lock");
        std::fs::write(&path, b"").unwrap();

        let opts = quick();
        let start = Instant::now();
        let err = acquire_with(&path, opts).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::LockTimeout { .. }), "{err}");
        assert!(elapsed >= opts.timeout);
        assert!(elapsed < opts.timeout + opts.poll_interval * 5, "{elapsed:?}");
        assert!(path.exists(), "foreign lock must not be removed");
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".stale-"))
            .collect()
    }

    #[test]
    fn old_lock_without_owner_pid_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("d.lock");
        let created = now_unix_ms() - 3_600_000;
        std::fs::write(&path, format!("created_unix_ms={created}\n")).unwrap();

        let opts = LockOptions {
            stale_after: Some(Duration::from_secs(60)),
            ..quick()
        };
        let handle = acquire_with(&path, opts).unwrap();
        let owner = parse_owner(&std::fs::read_to_string(handle.path()).unwrap());
        assert!(owner.created_unix_ms.unwrap() > created);
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn old_lock_of_live_owner_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.lock");

        let mut owner = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let created = now_unix_ms() - 11 * 60 * 1000;
        let contents = format!("pid={}\ncreated_unix_ms={created}\n", owner.id());
        std::fs::write(&path, &contents).unwrap();

        let opts = LockOptions {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            ..LockOptions::default()
        };
        let got = acquire_with(&path, opts);
        owner.kill().unwrap();
        owner.wait().unwrap();

        assert!(matches!(got, Err(Error::LockTimeout { .. })), "{got:?}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
    }

    #[test]
    fn changed_lock_is_put_back_not_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("g.lock");
        std::fs::write(&path, "pid=1\n").unwrap();

        assert!(!remove_if_unchanged(&path, "pid=2\n"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "pid=1\n");

        assert!(remove_if_unchanged(&path, "pid=1\n"));
        assert!(!path.exists());
        assert!(leftovers(tmp.path()).is_empty());

        // Already gone: the caller should simply retry.
        assert!(remove_if_unchanged(&path, "pid=1\n"));
    }

    #[cfg(unix)]
    #[test]
    fn racing_reclaimers_never_share_the_lock() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::{Arc, Barrier};

        let tmp = tempfile::tempdir().unwrap();
        let path = Arc::new(tmp.path().join("h.lock"));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        std::fs::write(
            path.as_path(),
            format!("pid={dead_pid}\ncreated_unix_ms={}\n", now_unix_ms()),
        )
        .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let holders = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let (path, barrier, holders) = (path.clone(), barrier.clone(), holders.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    let opts = LockOptions {
                        timeout: Duration::from_secs(10),
                        poll_interval: Duration::from_millis(5),
                        stale_after: None,
                    };
                    let _h = acquire_with(&path, opts).unwrap();
                    let inside = holders.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    inside
                })
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap(), 0, "two holders at once");
        }
        assert!(!path.exists());
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_dead_process_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("e.lock");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        std::fs::write(
            &path,
            format!("pid={dead_pid}\ncreated_unix_ms={}\n", now_unix_ms()),
        )
        .unwrap();
        let _handle = acquire_with(&path, quick()).unwrap();
    }

    #[test]
    fn parse_owner_ignores_garbage() {
        assert_eq!(parse_owner(""), LockOwner::default());
        let o = parse_owner("pid=12\nnoise\ncreated_unix_ms=x\n");
        assert_eq!(o.pid, Some(12));
        assert_eq!(o.created_unix_ms, None);
    }
}
