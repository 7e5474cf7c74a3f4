use std::fs::File;
use std::io::{Read, Write as _};
use std::path::Path;
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub bytes: u64,
    pub sha256: String,
}

/// Source of runtime archives. The installer talks to the network only
/// through this trait.
pub trait Fetcher: Send + Sync {
    /// Streams `url` into `dest`, hashing as it goes.
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<Downloaded>;

    fn fetch_text(&self, url: &str) -> Result<String>;
}

/// `http`, `https` and `file` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Option<Duration>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read>> {
        let download_err = |message: String| Error::Download {
            url: url.to_string(),
            message,
        };
        let parsed = Url::parse(url).map_err(|e| download_err(format!("parse url: {e}")))?;
        match parsed.scheme() {
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| download_err("file url is not a local path".to_string()))?;
                let f = File::open(&path)
                    .map_err(|e| download_err(format!("open {}: {e}", path.display())))?;
                Ok(Box::new(f))
            }
            "http" | "https" => {
                let resp = self
                    .agent
                    .get(url)
                    .call()
                    .map_err(|e| download_err(format!("GET: {e}")))?;
                Ok(Box::new(resp.into_body().into_reader()))
            }
            other => Err(download_err(format!("unsupported url scheme {other:?}"))),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<Downloaded> {
        let mut reader = self.open(url)?;
        let download_err = |message: String| Error::Download {
            url: url.to_string(),
            message,
        };

        let mut f = File::create(dest)
            .map_err(|e| Error::io(format!("create {}", dest.display()), e))?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let mut buf = [0u8; 1024 * 64];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| download_err(format!("read download stream: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            f.write_all(&buf[..n])
                .map_err(|e| Error::io(format!("write {}", dest.display()), e))?;
            bytes += n as u64;
        }
        f.flush()
            .map_err(|e| Error::io(format!("flush {}", dest.display()), e))?;

        Ok(Downloaded {
            bytes,
            sha256: hex_lower(&hasher.finalize()),
        })
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let mut reader = self.open(url)?;
        let mut s = String::new();
        reader.read_to_string(&mut s).map_err(|e| Error::Download {
            url: url.to_string(),
            message: format!("read body: {e}"),
        })?;
        Ok(s)
    }
}

/// Looks up `file_name` in a `SHASUMS256.txt` style listing.
pub fn find_checksum<'a>(listing: &'a str, file_name: &str) -> Option<&'a str> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == file_name).then_some(digest)
    })
}

pub fn eq_hex_sha256(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
