//! Executable resolution.
//!
//! Locates the OpenSSH binaries the fixture shells out to (`ssh`,
//! `ssh-keygen`, `sshd`). A candidate qualifies only if it is a regular,
//! executable, binary file. Wrapper scripts are rejected so that signal
//! delivery and version probing hit the real program. Resolutions are
//! cached for the lifetime of the run.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{ProvisionError, Result};

/// Installation roots searched after the OS search path. Daemons commonly
/// live in sbin directories that are absent from a user's `PATH`.
const EXTRA_DIRS: &[&str] = &[
    "/usr/sbin",
    "/usr/local/sbin",
    "/sbin",
    "/opt/homebrew/sbin",
    "/opt/homebrew/bin",
    "/usr/local/bin",
];

/// How many bytes of a candidate to sniff for the binary-content check.
const SNIFF_LEN: usize = 512;

fn cache() -> &'static Mutex<HashMap<String, PathBuf>> {
    static CACHE: OnceLock<Mutex<HashMap<String, PathBuf>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolves command names to usable executable paths.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    /// Bound on each `-V` version-probe subprocess.
    pub version_timeout: Duration,
}

impl Default for ExecutableResolver {
    fn default() -> Self {
        Self {
            version_timeout: Duration::from_secs(2),
        }
    }
}

impl ExecutableResolver {
    /// Create a resolver with the given version-probe bound.
    #[must_use]
    pub const fn new(version_timeout: Duration) -> Self {
        Self { version_timeout }
    }

    /// Resolve `name` to the first qualifying candidate.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] when no candidate qualifies.
    /// This is a recoverable condition, not fatal to the overall run.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf> {
        self.resolve_inner(name, None).await
    }

    /// Resolve `name`, additionally requiring a reported major version of
    /// at least `min_major`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] when no candidate both
    /// qualifies and meets the version constraint.
    pub async fn resolve_min_version(&self, name: &str, min_major: u32) -> Result<PathBuf> {
        self.resolve_inner(name, Some(min_major)).await
    }

    async fn resolve_inner(&self, name: &str, min_major: Option<u32>) -> Result<PathBuf> {
        if let Some(cached) = cache().lock().expect("resolver cache poisoned").get(name) {
            trace!(name, path = %cached.display(), "resolver cache hit");
            return Ok(cached.clone());
        }

        for candidate in candidates(name) {
            if !qualifies(&candidate) {
                trace!(candidate = %candidate.display(), "candidate rejected");
                continue;
            }
            if let Some(min_major) = min_major {
                match self.probe_version(&candidate).await {
                    Some(major) if major >= min_major => {
                        debug!(name, candidate = %candidate.display(), major, "version accepted");
                    }
                    Some(major) => {
                        debug!(
                            name,
                            candidate = %candidate.display(),
                            major,
                            min_major,
                            "version below minimum"
                        );
                        continue;
                    }
                    None => {
                        debug!(name, candidate = %candidate.display(), "no version signature");
                        continue;
                    }
                }
            }
            debug!(name, path = %candidate.display(), "resolved executable");
            cache()
                .lock()
                .expect("resolver cache poisoned")
                .insert(name.to_string(), candidate.clone());
            return Ok(candidate);
        }

        debug!(name, "no qualifying executable found");
        Err(ProvisionError::not_found(name))
    }

    /// Run `<candidate> -V` and scan its output for a major version.
    ///
    /// OpenSSH reports its version on stderr, so both streams are scanned.
    async fn probe_version(&self, candidate: &Path) -> Option<u32> {
        let mut child = match Command::new(candidate)
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!(candidate = %candidate.display(), %err, "version probe failed to spawn");
                return None;
            }
        };

        let mut output = Vec::new();
        let collect = async {
            if let Some(mut stdout) = child.stdout.take() {
                let _ = stdout.read_to_end(&mut output).await;
            }
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_end(&mut output).await;
            }
            let _ = child.wait().await;
        };
        if tokio::time::timeout(self.version_timeout, collect)
            .await
            .is_err()
        {
            warn!(candidate = %candidate.display(), "version probe timed out");
            let _ = child.start_kill();
            return None;
        }

        parse_major_version(&String::from_utf8_lossy(&output))
    }
}

/// Candidate paths for `name`: the OS search path first, then well-known
/// installation roots, de-duplicated in order.
fn candidates(name: &str) -> Vec<PathBuf> {
    let mut seen = Vec::new();
    if let Ok(found) = which::which_all(name) {
        for path in found {
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
    }
    for dir in EXTRA_DIRS {
        let path = Path::new(dir).join(name);
        if path.is_file() && !seen.contains(&path) {
            seen.push(path);
        }
    }
    seen
}

/// Regular file, executable, and binary content.
fn qualifies(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return false;
        }
    }
    let mut head = [0u8; SNIFF_LEN];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(read) = file.read(&mut head) else {
        return false;
    };
    looks_binary(&head[..read])
}

/// Binary-content heuristic: not a `#!` wrapper script, and carries NUL
/// bytes in its first block the way a compiled executable does.
fn looks_binary(head: &[u8]) -> bool {
    if head.starts_with(b"#!") {
        return false;
    }
    head.contains(&0)
}

/// Extract the major version from a `major.minor` token, e.g.
/// `OpenSSH_9.6p1 ...` yields 9.
fn parse_major_version(output: &str) -> Option<u32> {
    static VERSION: OnceLock<regex::Regex> = OnceLock::new();
    let re = VERSION.get_or_init(|| {
        regex::Regex::new(r"(\d+)\.(\d+)").expect("version pattern is valid")
    });
    re.captures(output)?.get(1)?.as_str().parse().ok()
}
