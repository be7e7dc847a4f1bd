//! TLS material provisioning
//!
//! Makes sure DH parameters, certificate and key exist before a secured
//! generation starts. Generation itself is delegated to a
//! [`CryptoProvider`]; results are persisted through the settings store.

use crate::config::{Settings, SettingsStore};
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Certificate file written for the worker
pub const CERT_FILE: &str = "server.crt";
/// Key file written for the worker
pub const KEY_FILE: &str = "server.key";

/// PEM certificate and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert: String,
    pub key: String,
}

/// Generates cryptographic material
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// PEM-encoded Diffie-Hellman parameters
    async fn generate_dh_params(&self) -> Result<String, ProvisionError>;

    /// Self-issued server certificate and key
    async fn generate_server_cert(
        &self,
        domain: Option<&str>,
    ) -> Result<CertificatePair, ProvisionError>;
}

/// Provider backed by the `openssl` command line tool
pub struct OpensslProvider {
    program: String,
    dh_bits: u32,
    work_dir: PathBuf,
}

impl OpensslProvider {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "openssl".to_string(),
            dh_bits: 2048,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_dh_bits(mut self, bits: u32) -> Self {
        self.dh_bits = bits;
        self
    }

    async fn run(&self, command: &mut Command) -> Result<Vec<u8>, ProvisionError> {
        let output = command
            .env("OPENSSL_CONF", "/dev/null")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProvisionError::Provider(format!("could not execute openssl: {e}")))?;

        if !output.status.success() {
            error!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "openssl failed"
            );
            return Err(ProvisionError::Provider(format!(
                "openssl exited with {}",
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl CryptoProvider for OpensslProvider {
    async fn generate_dh_params(&self) -> Result<String, ProvisionError> {
        info!(bits = self.dh_bits, "Generating DH parameters");
        let stdout = self
            .run(
                Command::new(&self.program)
                    .arg("dhparam")
                    .arg(self.dh_bits.to_string()),
            )
            .await?;
        String::from_utf8(stdout)
            .map_err(|e| ProvisionError::Provider(format!("DH parameters are not UTF-8: {e}")))
    }

    async fn generate_server_cert(
        &self,
        domain: Option<&str>,
    ) -> Result<CertificatePair, ProvisionError> {
        let cn = domain.unwrap_or("localhost");
        info!(cn = %cn, "Generating self-issued server certificate");

        create_dir(&self.work_dir).await?;
        let key_path = self.work_dir.join("generate.key");
        let cert_path = self.work_dir.join("generate.crt");

        let result = self
            .run(
                Command::new(&self.program)
                    .args(["req", "-x509"])
                    .args(["-newkey", "ec"])
                    .args(["-pkeyopt", "ec_paramgen_curve:P-256"])
                    .arg("-keyout")
                    .arg(&key_path)
                    .arg("-out")
                    .arg(&cert_path)
                    .arg("-nodes")
                    .arg("-sha256")
                    .args(["-days", "3650"])
                    .arg("-subj")
                    .arg(format!("/CN={cn}"))
                    .args(["-addext", "basicConstraints=critical,CA:FALSE"])
                    .args(["-addext", "extendedKeyUsage=serverAuth"]),
            )
            .await;

        let pair = async {
            result?;
            Ok::<_, ProvisionError>(CertificatePair {
                cert: read_text(&cert_path).await?,
                key: read_text(&key_path).await?,
            })
        }
        .await;

        remove_scratch(&key_path).await;
        remove_scratch(&cert_path).await;
        pair
    }
}

/// Remove a temporary file; a missing file is fine
async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}

async fn read_text(path: &Path) -> Result<String, ProvisionError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProvisionError::Write {
            path: path.display().to_string(),
            source,
        })
}

async fn create_dir(path: &Path) -> Result<(), ProvisionError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ProvisionError::Write {
            path: path.display().to_string(),
            source,
        })
}

/// Ensures TLS material exists and writes it out for the worker
#[derive(Clone)]
pub struct TlsProvisioner {
    provider: Arc<dyn CryptoProvider>,
}

impl TlsProvisioner {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Generate and persist whatever material is missing
    ///
    /// Idempotent: does nothing when DH parameters, certificate and key are
    /// all present.
    pub async fn ensure_server_cert(&self, store: &dyn SettingsStore) -> Result<(), ProvisionError> {
        let settings = store.settings();

        if settings.server_dh_params.is_none() {
            let dh_params = self.provider.generate_dh_params().await?;
            store.update(&mut |s| s.server_dh_params = Some(dh_params.clone()));
            store.commit().await?;
            info!("DH parameters provisioned");
        }

        if settings.server_cert.is_none() || settings.server_key.is_none() {
            let pair = self
                .provider
                .generate_server_cert(settings.acme_domain.as_deref())
                .await?;
            store.update(&mut |s| {
                s.server_cert = Some(pair.cert.clone());
                s.server_key = Some(pair.key.clone());
            });
            store.commit().await?;
            info!("Server certificate provisioned");
        }

        Ok(())
    }
}

/// Write certificate and key under `settings.data_dir`
///
/// Returns the certificate and key paths. The key file is only readable by
/// the owner on unix.
pub async fn write_server_cert(settings: &Settings) -> Result<(PathBuf, PathBuf), ProvisionError> {
    let (Some(cert), Some(key)) = (&settings.server_cert, &settings.server_key) else {
        return Err(ProvisionError::Provider(
            "server certificate or key missing".to_string(),
        ));
    };

    create_dir(&settings.data_dir).await?;
    let cert_path = settings.data_dir.join(CERT_FILE);
    let key_path = settings.data_dir.join(KEY_FILE);

    write_file(&cert_path, cert).await?;
    write_private_file(&key_path, key).await?;

    Ok((cert_path, key_path))
}

/// Write `contents` to a file that is never readable by anyone but the owner
///
/// New files are created with mode 0600; an existing file is narrowed to
/// 0600 before it is truncated and rewritten.
#[cfg(unix)]
async fn write_private_file(path: &Path, contents: &str) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    let write_err = |source: std::io::Error| ProvisionError::Write {
        path: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(write_err)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(write_err)?;
    file.set_len(0).await.map_err(write_err)?;
    file.write_all(contents.as_bytes()).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)
}

#[cfg(not(unix))]
async fn write_private_file(path: &Path, contents: &str) -> Result<(), ProvisionError> {
    write_file(path, contents).await
}

async fn write_file(path: &Path, contents: &str) -> Result<(), ProvisionError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ProvisionError::Write {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
#[path = "tls_test.rs"]
mod tests;
