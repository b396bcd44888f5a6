//! Key material provisioning.
//!
//! Ensures a host key and a user key pair exist inside the fixture's
//! private key directory, generating them with `ssh-keygen` when absent.
//! Generation goes through randomized temporary names and is renamed into
//! place only on full success, so concurrent test processes sharing the
//! same directory never observe a partial pair.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use rand::Rng;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};
use crate::resolver::ExecutableResolver;

/// A generated key pair on disk.
///
/// Valid only while both files exist; [`KeyMaterialProvisioner::ensure_keypair`]
/// upholds this by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// The private key file.
    pub private_path: PathBuf,
    /// The public key file (`<private>.pub`).
    pub public_path: PathBuf,
}

impl KeyPair {
    /// Both halves exist on disk.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.private_path.is_file() && self.public_path.is_file()
    }
}

/// Generates SSH key pairs idempotently.
#[derive(Debug, Clone, Default)]
pub struct KeyMaterialProvisioner {
    resolver: ExecutableResolver,
}

impl KeyMaterialProvisioner {
    /// Create a provisioner using the given resolver.
    #[must_use]
    pub const fn new(resolver: ExecutableResolver) -> Self {
        Self { resolver }
    }

    /// Ensure a key pair exists at `path`/`path.pub`.
    ///
    /// Idempotent: an existing valid pair is reused without touching disk.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] when `ssh-keygen` cannot be
    /// resolved and [`ProvisionError::GenerationFailed`] when generation or
    /// the final rename fails; partial artifacts are removed before
    /// returning.
    pub async fn ensure_keypair(&self, path: &Path) -> Result<KeyPair> {
        let pair = KeyPair {
            private_path: path.to_path_buf(),
            public_path: public_path_of(path),
        };
        if pair.is_valid() {
            debug!(path = %path.display(), "reusing existing key pair");
            return Ok(pair);
        }

        let keygen = self.resolver.resolve("ssh-keygen").await?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::io_context("creating key directory", e))?;
        }

        // Randomized temp names in the same directory keep the final rename
        // atomic and avoid partial-file races between concurrent runs.
        let suffix: u32 = rand::rng().random();
        let temp_private = path.with_file_name(format!(
            ".{}.{suffix:08x}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "key".to_string())
        ));
        let temp_public = public_path_of(&temp_private);

        let generated = self.generate(&keygen, &temp_private).await;
        let result = match generated {
            Ok(()) => {
                let renamed = std::fs::rename(&temp_private, &pair.private_path)
                    .and_then(|()| std::fs::rename(&temp_public, &pair.public_path));
                match renamed {
                    Ok(()) => Ok(()),
                    Err(err) => Err(ProvisionError::GenerationFailed {
                        path: path.to_path_buf(),
                        reason: format!("renaming generated keys into place: {err}"),
                    }),
                }
            }
            Err(err) => Err(err),
        };

        if result.is_err() {
            // Never leave half a pair behind.
            remove_if_present(&temp_private);
            remove_if_present(&temp_public);
            remove_if_present(&pair.private_path);
            remove_if_present(&pair.public_path);
        }
        result.map(|()| {
            debug!(path = %path.display(), "generated key pair");
            pair
        })
    }

    async fn generate(&self, keygen: &Path, private: &Path) -> Result<()> {
        let output = Command::new(keygen)
            .args(["-t", "ed25519"])
            .arg("-f")
            .arg(private)
            .args(["-N", ""])
            .arg("-q")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProvisionError::SpawnFailed {
                command: keygen.display().to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProvisionError::GenerationFailed {
                path: private.to_path_buf(),
                reason: format!(
                    "ssh-keygen exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions(private, std::fs::Permissions::from_mode(0o600))
            {
                warn!(path = %private.display(), %err, "failed to tighten key permissions");
            }
        }

        Ok(())
    }
}

/// `path` with `.pub` appended to the file name.
fn public_path_of(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".pub");
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(path = %path.display(), %err, "failed to remove partial key artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_path_appends_pub() {
        assert_eq!(
            public_path_of(Path::new("/tmp/keys/user_key")),
            PathBuf::from("/tmp/keys/user_key.pub")
        );
    }

    #[test]
    fn pair_validity_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("k");
        let pair = KeyPair {
            private_path: private.clone(),
            public_path: public_path_of(&private),
        };
        assert!(!pair.is_valid());
        std::fs::write(&pair.private_path, "x").unwrap();
        assert!(!pair.is_valid());
        std::fs::write(&pair.public_path, "y").unwrap();
        assert!(pair.is_valid());
    }

    #[tokio::test]
    async fn existing_pair_is_reused_without_keygen() {
        // Works even where ssh-keygen is absent: the idempotent path never
        // resolves the executable.
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("user_key");
        std::fs::write(&private, "private").unwrap();
        std::fs::write(public_path_of(&private), "public").unwrap();

        let provisioner = KeyMaterialProvisioner::default();
        let pair = provisioner.ensure_keypair(&private).await.unwrap();
        assert_eq!(std::fs::read(&pair.private_path).unwrap(), b"private");
        assert_eq!(std::fs::read(&pair.public_path).unwrap(), b"public");
    }
}
