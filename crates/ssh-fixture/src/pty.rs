//! Pseudo-terminal subprocess driving (Unix only).
//!
//! The password probe needs the SSH client to believe it has a controlling
//! terminal, so the client is spawned via openpty + fork + execvp with the
//! slave side as its stdio. The master side is wrapped in a tokio
//! [`AsyncFd`] for bounded-wait reads and writes.
//!
//! Platforms without PTY/fork support get [`ProvisionError::UnsupportedPlatform`]
//! from the caller instead of a hang; this module only compiles on Unix.

#![cfg(unix)]
#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// A subprocess attached to a pseudo-terminal.
#[derive(Debug)]
pub struct PtySession {
    master: AsyncFd<RawFd>,
    pid: libc::pid_t,
    exit_code: Option<i32>,
}

impl PtySession {
    /// Fork and exec `command` with a fresh PTY as its controlling
    /// terminal and stdio.
    ///
    /// # Errors
    ///
    /// Returns a spawn failure when the command contains NUL bytes, PTY
    /// allocation fails, or fork fails. An exec failure surfaces as the
    /// child exiting with code 127.
    pub fn spawn(command: &Path, args: &[String]) -> Result<Self> {
        let command_text = command.display().to_string();
        let spawn_failed = |message: String| ProvisionError::SpawnFailed {
            command: command_text.clone(),
            source: io::Error::other(message),
        };

        // Validate and build CStrings before forking so errors are clean.
        let cmd_cstring = CString::new(command_text.as_str())
            .map_err(|_| spawn_failed("command contains null byte".to_string()))?;
        let mut argv_cstrings: Vec<CString> = Vec::with_capacity(args.len() + 1);
        argv_cstrings.push(cmd_cstring.clone());
        for arg in args {
            argv_cstrings.push(
                CString::new(arg.as_str())
                    .map_err(|_| spawn_failed("argument contains null byte".to_string()))?,
            );
        }

        // SAFETY: openpty() is called with valid pointers to stack-allocated
        // integers; the null name/termios/winsize pointers are allowed per
        // POSIX. The return value is checked.
        let (master_fd, slave_fd) = unsafe {
            let mut master: libc::c_int = 0;
            let mut slave: libc::c_int = 0;
            if libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ) != 0
            {
                return Err(spawn_failed("failed to allocate PTY".to_string()));
            }
            (master, slave)
        };

        // SAFETY: fork() is called with no locks held. The child only
        // performs async-signal-safe operations before exec.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                // SAFETY: both fds came from openpty and are owned here.
                unsafe {
                    libc::close(master_fd);
                    libc::close(slave_fd);
                }
                Err(ProvisionError::SpawnFailed {
                    command: command_text,
                    source: io::Error::last_os_error(),
                })
            }
            0 => {
                // Child: new session, slave as controlling terminal and
                // stdio, then exec. Exits 127 if exec fails.
                // SAFETY: runs only in the forked child; all fds are valid
                // and owned by this process.
                unsafe {
                    libc::close(master_fd);
                    libc::setsid();
                    libc::ioctl(slave_fd, libc::TIOCSCTTY, 0);
                    libc::dup2(slave_fd, 0);
                    libc::dup2(slave_fd, 1);
                    libc::dup2(slave_fd, 2);
                    if slave_fd > 2 {
                        libc::close(slave_fd);
                    }
                    let argv_ptrs: Vec<*const libc::c_char> = argv_cstrings
                        .iter()
                        .map(|s| s.as_ptr())
                        .chain(std::iter::once(std::ptr::null()))
                        .collect();
                    libc::execvp(cmd_cstring.as_ptr(), argv_ptrs.as_ptr());
                    libc::_exit(127);
                }
            }
            child_pid => {
                // Parent keeps only the nonblocking master side.
                // SAFETY: both fds are valid; F_SETFL with O_NONBLOCK is a
                // standard operation on an owned fd.
                unsafe {
                    libc::close(slave_fd);
                    let flags = libc::fcntl(master_fd, libc::F_GETFL);
                    libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
                let master = AsyncFd::new(master_fd).map_err(|e| {
                    // SAFETY: master_fd is still owned here on this path.
                    unsafe { libc::close(master_fd) };
                    ProvisionError::io_context("registering PTY master fd", e)
                })?;
                debug!(pid = child_pid, command = %command_text, "spawned PTY subprocess");
                Ok(Self {
                    master,
                    pid: child_pid,
                    exit_code: None,
                })
            }
        }
    }

    /// The child's process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Read available output from the terminal, waiting until readable.
    ///
    /// Returns `Ok(0)` at end of stream. A closed slave side reports `EIO`
    /// on Linux; that is normalized to EOF.
    ///
    /// # Errors
    ///
    /// Propagates read errors other than the EOF condition above.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            let fd = *self.master.get_ref();
            // SAFETY: fd is a valid owned descriptor and buf a valid
            // mutable slice.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                }
                _ if err.raw_os_error() == Some(libc::EIO) => return Ok(0),
                _ => return Err(err),
            }
        }
    }

    /// Write all of `data` to the terminal.
    ///
    /// # Errors
    ///
    /// Propagates write errors from the master side.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self.master.writable().await?;
            let fd = *self.master.get_ref();
            // SAFETY: fd is a valid owned descriptor and remaining a valid
            // slice.
            let n = unsafe {
                libc::write(
                    fd,
                    remaining.as_ptr().cast::<libc::c_void>(),
                    remaining.len(),
                )
            };
            if n >= 0 {
                remaining = &remaining[n as usize..];
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: i32) {
        if self.exit_code.is_some() {
            return;
        }
        // SAFETY: kill() is memory-safe for any pid; ESRCH on a reaped
        // child is ignored.
        unsafe {
            libc::kill(self.pid, signal);
        }
    }

    /// Poll the child without blocking.
    ///
    /// Returns the exit code once the child has exited (signal terminations
    /// map to `128 + signo`), caching the result for repeated calls.
    pub fn try_wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit_code {
            return Some(code);
        }
        let mut status: libc::c_int = 0;
        // SAFETY: pid is our forked child; status points to stack storage;
        // WNOHANG makes this nonblocking.
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if rc != self.pid {
            return None;
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        };
        self.exit_code = Some(code);
        Some(code)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            // SAFETY: see signal(); best-effort kill of an unreaped child.
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                let mut status: libc::c_int = 0;
                libc::waitpid(self.pid, &mut status, libc::WNOHANG);
            }
        }
        // SAFETY: the master fd is owned by this struct and closed once.
        unsafe {
            libc::close(*self.master.get_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_rejects_null_bytes() {
        let err = PtySession::spawn(Path::new("bad\0name"), &[]).unwrap_err();
        assert!(matches!(err, ProvisionError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn echo_output_is_readable_and_child_exits() {
        let mut session =
            PtySession::spawn(&PathBuf::from("/bin/echo"), &["pty-check".to_string()]).unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let read = tokio::time::timeout_at(deadline, session.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("pty-check"));

        let mut code = session.try_wait();
        let poll_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while code.is_none() && tokio::time::Instant::now() < poll_deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            code = session.try_wait();
        }
        assert_eq!(code, Some(0));
        // Cached after reaping.
        assert_eq!(session.try_wait(), Some(0));
    }

    #[tokio::test]
    async fn exec_failure_exits_127() {
        let mut session =
            PtySession::spawn(&PathBuf::from("/nonexistent/ssh-client"), &[]).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(code) = session.try_wait() {
                assert_eq!(code, 127);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "child never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
