//! End-to-end tests against a real ephemeral sshd.
//!
//! These tests exercise the full provisioning cycle and therefore need the
//! OpenSSH binaries on the host. When `sshd`, `ssh`, or `ssh-keygen` cannot
//! be resolved the tests skip cleanly instead of failing: "no backend" is
//! a recoverable condition, not a defect.

#![cfg(unix)]

use std::time::Duration;

use ssh_fixture::{
    acquire, AuthMethod, BackendKind, ConnectivityProbe, ExecutableResolver, FixtureConfig,
    PortAllocator, TimeoutConfig,
};

/// True when the host has the full OpenSSH tool set.
async fn openssh_available() -> bool {
    let resolver = ExecutableResolver::default();
    for name in ["sshd", "ssh", "ssh-keygen"] {
        if resolver.resolve(name).await.is_err() {
            eprintln!("skipping: {name} not resolvable on this host");
            return false;
        }
    }
    true
}

/// Provision an ephemeral daemon, run a real remote command over the
/// generated key, then dispose and verify nothing is left running and the
/// working directory was archived.
#[tokio::test]
async fn provision_probe_and_dispose() {
    if !openssh_available().await {
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let config = FixtureConfig::default()
        .with_private_root(root.path())
        .with_backends(vec![BackendKind::EphemeralDaemon]);

    let mut handle = match acquire(&config).await {
        Ok(handle) => handle,
        Err(err) => {
            // Constrained environments (no PTYs, locked-down sshd) surface
            // here; that is the contract's "skip dependent tests" signal.
            eprintln!("skipping: acquire failed: {err}");
            return;
        }
    };

    assert!(handle.owns_daemon());
    let endpoint = handle.endpoint().clone();
    assert_eq!(endpoint.host, "127.0.0.1");
    assert_eq!(endpoint.auth_method(), AuthMethod::PublicKey);

    // The handle must accept further probes while the daemon is alive; its
    // probe path also verifies liveness first.
    let probe = ConnectivityProbe::new(ExecutableResolver::default(), TimeoutConfig::default());
    handle
        .probe(&probe, "echo foo")
        .await
        .expect("probe of running ephemeral daemon");

    let port = endpoint.port;
    handle.close().await;

    // No daemon process may remain: poll until its port stops answering.
    let allocator = PortAllocator::default();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !allocator.is_listening(port).await {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "daemon still listening after close"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The run directory was renamed into the fixed archive location.
    let run_dir = config.run_dir(std::process::id());
    assert!(!run_dir.exists(), "run directory was not archived");
    let archive = config.archive_dir();
    assert!(archive.exists(), "archive location missing");
    assert!(archive.join("sshd_config").exists());
}

/// A wrong password must fail within the probe timeout plus a small
/// epsilon, never hang.
#[tokio::test]
async fn wrong_password_fails_within_timeout() {
    if !openssh_available().await {
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let mut timeouts = TimeoutConfig::default();
    timeouts.probe = Duration::from_secs(5);
    let mut config = FixtureConfig::default()
        .with_private_root(root.path())
        .with_backends(vec![BackendKind::EphemeralDaemon]);
    config.timeouts = timeouts;

    let handle = match acquire(&config).await {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("skipping: acquire failed: {err}");
            return;
        }
    };

    let mut endpoint = handle.endpoint().clone();
    endpoint.credential = ssh_fixture::Credential::Password("definitely-wrong".to_string());

    let probe = ConnectivityProbe::new(ExecutableResolver::default(), timeouts);
    let started = std::time::Instant::now();
    let outcome = probe.probe(&endpoint, "true").await;
    let elapsed = started.elapsed();

    assert!(outcome.is_err(), "wrong password was accepted");
    assert!(
        elapsed < timeouts.probe + Duration::from_secs(3),
        "probe exceeded its bound: {elapsed:?}"
    );

    handle.close().await;
}
