//! Connectivity and authentication probing.
//!
//! One probe = one attempt to run a short non-interactive remote command
//! under a specific credential. Public-key probes are a plain subprocess
//! invocation of the SSH client in batch mode; password probes drive a
//! PTY-attached client through a small state machine that injects the
//! secret when a password prompt appears.
//!
//! Every probe logs the command line attempted and the outcome. The
//! password value itself never reaches a log; where it must be mentioned
//! it is rendered as `*****`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::endpoint::{Credential, ProbeAttempt, SshEndpoint, REDACTED};
use crate::error::{ProvisionError, Result};
use crate::resolver::ExecutableResolver;

/// Options common to every client invocation: no host-key prompting, no
/// known-hosts persistence.
const COMMON_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "GlobalKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

/// Watches a byte stream for a password prompt and decides when to inject.
///
/// Heuristic per the historical behavior this crate preserves: the
/// accumulated tail, with trailing whitespace trimmed, ends in `:` or `?`.
/// This can misfire on verbose remote output that happens to end in a
/// colon; the watcher therefore fires at most once and never re-arms after
/// the first injection.
#[derive(Debug, Default)]
pub struct PromptWatcher {
    buffer: Vec<u8>,
    fired: bool,
}

impl PromptWatcher {
    /// Create an armed watcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the secret has already been injected.
    #[must_use]
    pub const fn has_fired(&self) -> bool {
        self.fired
    }

    /// Feed freshly read bytes; returns `true` exactly once, when the
    /// accumulated output ends in a prompt. The buffer is cleared on fire.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        if self.fired {
            return false;
        }
        self.buffer.extend_from_slice(bytes);
        let tail = trim_trailing_whitespace(&self.buffer);
        if matches!(tail.last(), Some(b':' | b'?')) {
            self.fired = true;
            self.buffer.clear();
            return true;
        }
        false
    }
}

fn trim_trailing_whitespace(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Runs probe attempts against SSH endpoints.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    resolver: ExecutableResolver,
    timeouts: TimeoutConfig,
}

impl ConnectivityProbe {
    /// Create a probe using the given resolver and timeout set.
    #[must_use]
    pub const fn new(resolver: ExecutableResolver, timeouts: TimeoutConfig) -> Self {
        Self { resolver, timeouts }
    }

    /// Execute `command` on `endpoint` under its credential.
    ///
    /// Success is the client exiting zero within the probe timeout.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::Timeout`] on an elapsed bound (after escalating
    /// TERM then KILL), [`ProvisionError::ProbeFailed`] on a nonzero exit,
    /// [`ProvisionError::UnsupportedPlatform`] for password probes on
    /// platforms without PTY support, plus resolution/spawn errors.
    pub async fn probe(&self, endpoint: &SshEndpoint, command: &str) -> Result<()> {
        let attempt = ProbeAttempt {
            endpoint,
            command,
            timeout: self.timeouts.probe,
        };
        debug!("{}", attempt.describe());
        let outcome = match &endpoint.credential {
            Credential::PrivateKey(key) => self.probe_public_key(endpoint, key, command).await,
            Credential::Password(secret) => {
                self.probe_password(endpoint, secret, command).await
            }
        };
        match &outcome {
            Ok(()) => debug!(target = %endpoint, "probe succeeded"),
            Err(err) => debug!(target = %endpoint, %err, "probe failed"),
        }
        outcome
    }

    async fn probe_public_key(
        &self,
        endpoint: &SshEndpoint,
        key: &Path,
        command: &str,
    ) -> Result<()> {
        let ssh = self.resolver.resolve("ssh").await?;

        let mut args: Vec<String> = COMMON_OPTS.iter().map(ToString::to_string).collect();
        // Batch mode: any prompt is an immediate failure, never a hang.
        args.extend(["-o".into(), "BatchMode=yes".into()]);
        args.extend(["-o".into(), "IdentitiesOnly=yes".into()]);
        args.extend(["-i".into(), key.display().to_string()]);
        args.extend(["-p".into(), endpoint.port.to_string()]);
        args.push(format!("{}@{}", endpoint.username, endpoint.host));
        args.push(command.to_string());
        debug!(client = %ssh.display(), args = %args.join(" "), "running public-key probe");

        let mut child = Command::new(&ssh)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::SpawnFailed {
                command: ssh.display().to_string(),
                source: e,
            })?;

        let mut stderr_pipe = child.stderr.take();
        let mut stderr_buf = Vec::new();
        let wait = async {
            if let Some(stderr) = stderr_pipe.as_mut() {
                let _ = stderr.read_to_end(&mut stderr_buf).await;
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(self.timeouts.probe, wait).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ProvisionError::io_context("waiting for ssh client", err)),
            Err(_) => {
                self.escalate_std(&mut child).await;
                return Err(ProvisionError::timeout(
                    self.timeouts.probe,
                    "waiting for ssh client exit",
                ));
            }
        };

        if status.success() {
            Ok(())
        } else {
            let stderr_text = String::from_utf8_lossy(&stderr_buf);
            warn!(
                target = %endpoint,
                %status,
                stderr = %stderr_text.trim(),
                "public-key probe rejected"
            );
            Err(ProvisionError::ProbeFailed {
                target: endpoint.to_uri_redacted(),
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }

    /// TERM, short grace, then KILL for a plain (non-PTY) client.
    async fn escalate_std(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            send_term(pid);
            tokio::time::sleep(self.timeouts.kill_grace).await;
        }
        let _ = child.start_kill();
        let _ = tokio::time::timeout(self.timeouts.kill_grace, child.wait()).await;
    }

    #[cfg(unix)]
    async fn probe_password(
        &self,
        endpoint: &SshEndpoint,
        secret: &str,
        command: &str,
    ) -> Result<()> {
        use crate::pty::PtySession;

        let ssh = self.resolver.resolve("ssh").await?;
        let mut args: Vec<String> = COMMON_OPTS.iter().map(ToString::to_string).collect();
        args.extend(["-o".into(), "BatchMode=no".into()]);
        args.extend([
            "-o".into(),
            "PreferredAuthentications=keyboard-interactive,password".into(),
        ]);
        args.extend(["-o".into(), "PubkeyAuthentication=no".into()]);
        args.extend(["-o".into(), "NumberOfPasswordPrompts=1".into()]);
        args.extend(["-p".into(), endpoint.port.to_string()]);
        args.push(format!("{}@{}", endpoint.username, endpoint.host));
        args.push(command.to_string());
        debug!(client = %ssh.display(), args = %args.join(" "), "running password probe");

        let mut session = PtySession::spawn(&ssh, &args)?;
        let mut watcher = PromptWatcher::new();
        let deadline = tokio::time::Instant::now() + self.timeouts.probe;
        let mut buf = [0u8; 1024];
        let mut eof = false;

        let exit_code = loop {
            if let Some(code) = session.try_wait() {
                break code;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(target = %endpoint, "password probe deadline elapsed, escalating");
                session.signal(libc::SIGTERM);
                tokio::time::sleep(self.timeouts.kill_grace).await;
                if session.try_wait().is_none() {
                    session.signal(libc::SIGKILL);
                }
                return Err(ProvisionError::timeout(
                    self.timeouts.probe,
                    "driving password-authenticated ssh client",
                ));
            }
            if eof {
                // Output is done; just poll for the exit status.
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            match tokio::time::timeout_at(deadline, session.read(&mut buf)).await {
                Ok(Ok(0)) => eof = true,
                Ok(Ok(n)) => {
                    if watcher.feed(&buf[..n]) {
                        debug!(target = %endpoint, "password prompt detected, sending {REDACTED}");
                        let mut line = secret.as_bytes().to_vec();
                        line.push(b'\n');
                        session
                            .write_all(&line)
                            .await
                            .map_err(|e| ProvisionError::io_context("writing password", e))?;
                    }
                }
                Ok(Err(err)) => {
                    return Err(ProvisionError::io_context("reading PTY output", err));
                }
                Err(_) => {
                    // Deadline check at the top of the loop handles it.
                }
            }
        };

        if exit_code == 0 {
            Ok(())
        } else {
            Err(ProvisionError::ProbeFailed {
                target: endpoint.to_uri_redacted(),
                exit_code,
            })
        }
    }

    #[cfg(not(unix))]
    async fn probe_password(
        &self,
        _endpoint: &SshEndpoint,
        _secret: &str,
        _command: &str,
    ) -> Result<()> {
        Err(ProvisionError::UnsupportedPlatform {
            feature: "pseudo-terminal password authentication".to_string(),
        })
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_term(pid: u32) {
    // SAFETY: kill() with our child's pid is memory-safe; a stale pid
    // yields ESRCH which is ignored.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_on_password_prompt() {
        let mut watcher = PromptWatcher::new();
        assert!(!watcher.feed(b"tester@127.0.0.1"));
        assert!(watcher.feed(b"'s password: "));
        assert!(watcher.has_fired());
    }

    #[test]
    fn fires_on_question_prompt() {
        let mut watcher = PromptWatcher::new();
        assert!(watcher.feed(b"Are you sure you want to continue connecting?"));
    }

    #[test]
    fn never_refires_after_first_injection() {
        let mut watcher = PromptWatcher::new();
        assert!(watcher.feed(b"Password: "));
        // Later prompt-like substrings in unrelated output must not
        // re-trigger the state machine.
        assert!(!watcher.feed(b"warning:\n"));
        assert!(!watcher.feed(b"really a prompt? "));
        assert!(watcher.has_fired());
    }

    #[test]
    fn mid_line_colon_does_not_fire() {
        let mut watcher = PromptWatcher::new();
        assert!(!watcher.feed(b"debug1: Reading configuration data\n"));
        assert!(!watcher.feed(b"more output\n"));
    }

    #[test]
    fn prompt_split_across_reads_fires() {
        let mut watcher = PromptWatcher::new();
        assert!(!watcher.feed(b"Pass"));
        assert!(watcher.feed(b"word: "));
    }

    #[test]
    fn trailing_whitespace_is_ignored() {
        assert_eq!(trim_trailing_whitespace(b"Password: \r\n"), b"Password:");
        assert_eq!(trim_trailing_whitespace(b"   "), b"");
    }
}
