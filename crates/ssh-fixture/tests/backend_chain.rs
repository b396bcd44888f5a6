//! Backend chain behavior that does not need a running daemon.

use ssh_fixture::{acquire, BackendKind, Credential, FixtureConfig, ProvisionError, SshEndpoint};

/// An ephemeral-only chain on a host without sshd yields
/// `NoBackendAvailable` and leaves the private root untouched.
///
/// On hosts where sshd is installed this scenario cannot occur, so the
/// test only asserts when the precondition holds.
#[tokio::test]
async fn unresolvable_sshd_yields_no_backend_and_no_workdir() {
    let resolver = ssh_fixture::ExecutableResolver::default();
    if resolver.resolve("sshd").await.is_ok() {
        eprintln!("skipping: sshd is resolvable on this host");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let config = FixtureConfig::default()
        .with_private_root(root.path())
        .with_backends(vec![BackendKind::EphemeralDaemon]);

    let err = acquire(&config).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoBackendAvailable { tried: 1 }));
    assert!(!root.path().join("run").exists());
    assert!(!root.path().join("keys").exists());
}

/// The selector walks the chain strictly in order and reports how many
/// backends it exhausted.
#[tokio::test]
async fn exhausted_chain_counts_attempts() {
    let root = tempfile::tempdir().unwrap();
    let mut config = FixtureConfig::default()
        .with_private_root(root.path())
        .with_backends(vec![BackendKind::ExplicitRemote, BackendKind::ExplicitRemote]);
    // Port 1 on loopback: reserved, nothing listens.
    config.remote_target = Some(
        SshEndpoint::new(
            "127.0.0.1",
            1,
            "tester",
            Credential::Password("pw".to_string()),
        )
        .unwrap(),
    );

    let err = acquire(&config).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoBackendAvailable { tried: 2 }));
}

/// A chain entry requiring a target without one configured is rejected up
/// front, before any backend runs.
#[tokio::test]
async fn misconfigured_chain_is_rejected() {
    let config = FixtureConfig::default().with_backends(vec![BackendKind::ExplicitRemote]);
    let err = acquire(&config).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Config { .. }));
}
