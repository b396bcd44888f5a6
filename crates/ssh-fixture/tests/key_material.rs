//! Key provisioning against the real ssh-keygen.

use ssh_fixture::{ExecutableResolver, KeyMaterialProvisioner};

/// Generation is idempotent: the second call performs no generation and
/// leaves the file contents byte-identical.
#[tokio::test]
async fn ensure_keypair_is_idempotent() {
    let resolver = ExecutableResolver::default();
    if resolver.resolve("ssh-keygen").await.is_err() {
        eprintln!("skipping: ssh-keygen not resolvable on this host");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys").join("user_key");
    let provisioner = KeyMaterialProvisioner::new(resolver);

    let first = provisioner.ensure_keypair(&path).await.unwrap();
    assert!(first.is_valid());
    let private = std::fs::read(&first.private_path).unwrap();
    let public = std::fs::read(&first.public_path).unwrap();
    assert!(!private.is_empty());
    assert!(!public.is_empty());

    let second = provisioner.ensure_keypair(&path).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&second.private_path).unwrap(), private);
    assert_eq!(std::fs::read(&second.public_path).unwrap(), public);

    // No temp artifacts left behind.
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp") || name.ends_with(".tmp.pub"))
        .collect();
    assert!(leftovers.is_empty(), "temp artifacts remain: {leftovers:?}");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&first.private_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "private key mode is {mode:o}");
    }
}
