//! TLS material loading for the runtime client.
//!
//! `BT_CA`/`BT_CERT`/`BT_KEY` each accept a file path or an inline PEM
//! document. Inline documents are materialized to mode-0600 files in a
//! scratch directory so the runtime connector can consume paths.

use rustls::crypto::ring::sign::any_supported_type;
use rustls::sign::SigningKey as _;
use std::fs;
use std::path::{Path, PathBuf};
use x509_parser::prelude::*;

use crate::config::TlsSettings;
use crate::error::{Error, Result};

/// Resolved on-disk TLS material, validated at load time.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsMaterial {
    /// Resolve, materialize, and validate TLS settings.
    ///
    /// Validation: the client certificate parses, its validity window
    /// contains now, the private key parses, and where the key type
    /// allows deriving an SPKI it must match the certificate's.
    pub fn load(settings: &TlsSettings, scratch_dir: &Path) -> Result<Self> {
        fs::create_dir_all(scratch_dir)?;

        let ca_path = resolve(&settings.ca, scratch_dir, "ca.pem")?;
        let cert_path = resolve(&settings.cert, scratch_dir, "cert.pem")?;
        let key_path = resolve(&settings.key, scratch_dir, "key.pem")?;

        let material = TlsMaterial {
            ca_path,
            cert_path,
            key_path,
        };
        material.validate()?;
        Ok(material)
    }

    fn validate(&self) -> Result<()> {
        let cert_pem = fs::read(&self.cert_path)?;
        let parsed = ::pem::parse(&cert_pem)
            .map_err(|e| Error::Security(format!("client certificate is not valid PEM: {e}")))?;
        let (_, cert) = X509Certificate::from_der(parsed.contents())
            .map_err(|e| Error::Security(format!("client certificate is not valid X.509: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        if now < not_before {
            return Err(Error::Security(format!(
                "client certificate is not yet valid (not before {})",
                cert.validity().not_before
            )));
        }
        if now > not_after {
            return Err(Error::Security(format!(
                "client certificate expired at {}",
                cert.validity().not_after
            )));
        }

        let key_pem = fs::read(&self.key_path)?;
        let key_der = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| Error::Security(format!("client key is not readable PEM: {e}")))?
            .ok_or_else(|| Error::Security("client key PEM contains no private key".into()))?;
        let signing_key = any_supported_type(&key_der)
            .map_err(|e| Error::Security(format!("unsupported client key type: {e}")))?;

        match signing_key.public_key() {
            Some(key_spki) => {
                if key_spki.as_ref() != cert.public_key().raw {
                    return Err(Error::Security(
                        "client certificate public key does not match the private key".into(),
                    ));
                }
            }
            None => {
                tracing::warn!(
                    "cannot derive public key from client key type, skipping cert/key match check"
                );
            }
        }

        Ok(())
    }
}

/// Turn a path-or-inline-PEM value into an on-disk path.
fn resolve(value: &str, scratch_dir: &Path, file_name: &str) -> Result<PathBuf> {
    if value.trim_start().starts_with("-----BEGIN") {
        let path = scratch_dir.join(file_name);
        fs::write(&path, value)?;
        restrict_permissions(&path)?;
        return Ok(path);
    }

    let path = PathBuf::from(value);
    if !path.is_file() {
        return Err(Error::Security(format!(
            "TLS material path '{}' does not exist",
            path.display()
        )));
    }
    Ok(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
