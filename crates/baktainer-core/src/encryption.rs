//! Encryption at rest for backup artifacts.
//!
//! Artifacts are sealed with AES-256-GCM into a small framed container:
//!
//! ```text
//! offset 0..3   : magic "BAKT"
//! offset 4      : format version (1)
//! offset 5      : algorithm-name length L
//! offset 6..6+L : algorithm name ("aes-256-gcm")
//! next 12 bytes : IV
//! ...           : ciphertext
//! last 16 bytes : authentication tag
//! ```
//!
//! Key material is resolved once at startup and held in memory only.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{EncryptionSettings, KeySource};
use crate::error::{Error, Result};
use crate::fileops;

/// Magic bytes opening every encrypted artifact.
pub const MAGIC: &[u8; 4] = b"BAKT";
/// Container format version.
pub const FORMAT_VERSION: u8 = 1;
/// The only algorithm the format currently carries.
pub const ALGORITHM: &str = "aes-256-gcm";

const KEY_SALT: &[u8] = b"baktainer-default-salt";
const PASSPHRASE_SALT: &[u8] = b"baktainer-backup-encryption-salt";
const PBKDF2_ITERATIONS: u32 = 100_000;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const IO_CHUNK: usize = 64 * 1024;

/// Sidecar written beside every encrypted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub algorithm: String,
    pub original_file: String,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub encrypted_at: DateTime<Utc>,
    /// First 16 hex chars of sha256(key); identifies which key sealed
    /// the artifact without revealing it.
    pub key_fingerprint: String,
}

/// AES-256-GCM file encryptor/decryptor.
pub struct EncryptionManager {
    key: [u8; 32],
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("key_fingerprint", &self.key_fingerprint())
            .finish()
    }
}

impl EncryptionManager {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Resolve the configured key source, or `None` when encryption is
    /// disabled.
    pub fn from_settings(settings: &EncryptionSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        let source = settings.key_source.as_ref().ok_or_else(|| {
            Error::Config("encryption enabled but no key source configured".into())
        })?;
        Ok(Some(Self::new(resolve_key(source)?)))
    }

    /// First 16 hex chars of sha256(key).
    pub fn key_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        hex::encode(digest)[..16].to_string()
    }

    /// Encrypt `plaintext_path` into `<plaintext_path>.encrypted`.
    ///
    /// On success the plaintext is best-effort securely deleted (random
    /// overwrite, fsync, unlink) and an [`EncryptionMetadata`] sidecar
    /// is written beside the ciphertext. A failure cleans up any
    /// partial ciphertext.
    pub fn encrypt_file(&self, plaintext_path: &Path) -> Result<(PathBuf, EncryptionMetadata)> {
        let plaintext = read_chunked(plaintext_path)?;
        let original_size = plaintext.len() as u64;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Encryption(format!("invalid key: {e}")))?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|e| Error::Encryption(format!("encryption failed: {e}")))?;

        let mut output = plaintext_path.as_os_str().to_os_string();
        output.push(".encrypted");
        let output = PathBuf::from(output);

        let write_result = fileops::write(&output, |w| {
            w.write_all(MAGIC)?;
            w.write_all(&[FORMAT_VERSION, ALGORITHM.len() as u8])?;
            w.write_all(ALGORITHM.as_bytes())?;
            w.write_all(&iv)?;
            w.write_all(&ciphertext)?;
            Ok(())
        });
        if let Err(e) = write_result {
            fileops::cleanup(&[output.clone()]);
            return Err(e);
        }
        let encrypted_size = fs::metadata(&output)?.len();

        let metadata = EncryptionMetadata {
            algorithm: ALGORITHM.to_string(),
            original_file: plaintext_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            original_size,
            encrypted_size,
            encrypted_at: Utc::now(),
            key_fingerprint: self.key_fingerprint(),
        };
        fileops::write_metadata(&output, &metadata);

        secure_delete(plaintext_path, original_size);

        Ok((output, metadata))
    }

    /// Decrypt an encrypted artifact into `output_path`.
    ///
    /// The authentication tag is verified before any plaintext is
    /// exposed; on tag mismatch the output file is removed.
    pub fn decrypt_file(&self, encrypted_path: &Path, output_path: &Path) -> Result<()> {
        let data = read_chunked(encrypted_path)?;
        let (iv, ciphertext) = parse_container(&data)?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Encryption(format!("invalid key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| {
                fileops::cleanup(&[output_path.to_path_buf()]);
                Error::Encryption("authentication failed".into())
            })?;

        fileops::write(output_path, |w| Ok(w.write_all(&plaintext)?))
    }

    /// Round-trip a scratch file to prove the key works end to end.
    pub fn verify_key(&self, scratch_dir: &Path) -> Result<()> {
        const PROBE: &[u8] = b"baktainer key verification probe\n";
        fs::create_dir_all(scratch_dir)?;
        let probe = scratch_dir.join(".baktainer-key-check");
        fileops::write(&probe, |w| Ok(w.write_all(PROBE)?))?;

        let result = (|| {
            let (encrypted, _) = self.encrypt_file(&probe)?;
            let restored = scratch_dir.join(".baktainer-key-check.restored");
            let outcome = self.decrypt_file(&encrypted, &restored).and_then(|()| {
                if fs::read(&restored)? == PROBE {
                    Ok(())
                } else {
                    Err(Error::Encryption("key verification round-trip mismatch".into()))
                }
            });
            fileops::cleanup(&[
                encrypted.clone(),
                fileops::meta_path(&encrypted),
                restored,
            ]);
            outcome
        })();
        fileops::cleanup(&[probe]);
        result
    }
}

/// Split a container into IV and ciphertext after validating the header.
fn parse_container(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < MAGIC.len() + 2 {
        return Err(Error::Encryption("truncated encrypted file".into()));
    }
    if &data[..4] != MAGIC {
        return Err(Error::Encryption("bad magic, not a baktainer artifact".into()));
    }
    if data[4] != FORMAT_VERSION {
        return Err(Error::Encryption(format!(
            "unsupported format version {}",
            data[4]
        )));
    }
    let alg_len = data[5] as usize;
    let header_len = 6 + alg_len + IV_LEN;
    if data.len() < header_len + TAG_LEN {
        return Err(Error::Encryption("truncated encrypted file".into()));
    }
    let algorithm = &data[6..6 + alg_len];
    if algorithm != ALGORITHM.as_bytes() {
        return Err(Error::Encryption(format!(
            "unsupported algorithm '{}'",
            String::from_utf8_lossy(algorithm)
        )));
    }
    let iv = &data[6 + alg_len..header_len];
    Ok((iv, &data[header_len..]))
}

/// Resolve key material per the documented precedence: raw 32 bytes,
/// 64 hex chars, `base64:` payload, then PBKDF2 over the raw string.
fn resolve_key(source: &KeySource) -> Result<[u8; 32]> {
    match source {
        KeySource::Literal(value) => key_from_string(value),
        KeySource::File(path) => {
            let contents = fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read key file '{}': {e}", path.display()))
            })?;
            key_from_string(contents.trim_end_matches(['\r', '\n']))
        }
        KeySource::Passphrase(passphrase) => {
            Ok(pbkdf2_key(passphrase.as_bytes(), PASSPHRASE_SALT))
        }
    }
}

fn key_from_string(value: &str) -> Result<[u8; 32]> {
    let bytes = value.as_bytes();
    if bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        return Ok(key);
    }
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        let decoded =
            hex::decode(value).map_err(|e| Error::Config(format!("invalid hex key: {e}")))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        return Ok(key);
    }
    if let Some(payload) = value.strip_prefix("base64:") {
        let decoded = BASE64
            .decode(payload)
            .map_err(|e| Error::Config(format!("invalid base64 encryption key: {e}")))?;
        if decoded.len() != 32 {
            return Err(Error::Config(format!(
                "base64 encryption key must decode to 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        return Ok(key);
    }
    Ok(pbkdf2_key(bytes, KEY_SALT))
}

fn pbkdf2_key(password: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn read_chunked(path: &Path) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut data = Vec::new();
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

/// Size-preserving random overwrite, fsync, unlink. Best-effort: a
/// failure downgrades to a plain unlink attempt with a warning.
fn secure_delete(path: &Path, size: u64) {
    let overwrite = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let mut remaining = size as usize;
        let mut chunk = vec![0u8; IO_CHUNK];
        while remaining > 0 {
            let n = remaining.min(IO_CHUNK);
            rand::thread_rng().fill_bytes(&mut chunk[..n]);
            file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        file.sync_all()
    })();
    if let Err(e) = overwrite {
        warn!(path = %path.display(), error = %e, "secure overwrite failed");
    }
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "plaintext removed after encryption"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove plaintext"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn zero_key_manager() -> EncryptionManager {
        EncryptionManager::new([0u8; 32])
    }

    #[test]
    fn test_container_format_byte_exact() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("hello.sql");
        fs::write(&plain, b"hello").unwrap();

        let manager = zero_key_manager();
        let (encrypted, metadata) = manager.encrypt_file(&plain).unwrap();
        assert_eq!(encrypted, tmp.path().join("hello.sql.encrypted"));

        let data = fs::read(&encrypted).unwrap();
        assert_eq!(&data[..4], b"BAKT");
        assert_eq!(data[4], 1);
        assert_eq!(data[5], 11);
        assert_eq!(&data[6..17], b"aes-256-gcm");
        // header (17) + IV (12) + ciphertext (5) + tag (16)
        assert_eq!(data.len(), 17 + 12 + 5 + 16);

        assert_eq!(metadata.original_size, 5);
        assert_eq!(metadata.encrypted_size, data.len() as u64);
        assert_eq!(metadata.algorithm, "aes-256-gcm");
        assert_eq!(metadata.key_fingerprint.len(), 16);
    }

    #[test]
    fn test_roundtrip_and_plaintext_removed() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("dump.sql");
        fs::write(&plain, b"-- PostgreSQL database dump\n").unwrap();

        let manager = zero_key_manager();
        let (encrypted, _) = manager.encrypt_file(&plain).unwrap();
        assert!(!plain.exists(), "plaintext securely deleted");
        assert!(fileops::meta_path(&encrypted).exists(), "sidecar written");

        let restored = tmp.path().join("restored.sql");
        manager.decrypt_file(&encrypted, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"-- PostgreSQL database dump\n");
    }

    #[test]
    fn test_tampering_fails_authentication() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("x.sql");
        fs::write(&plain, b"hello").unwrap();

        let manager = zero_key_manager();
        let (encrypted, _) = manager.encrypt_file(&plain).unwrap();
        let original = fs::read(&encrypted).unwrap();

        // Flip every byte of the ciphertext+tag region in turn.
        let body_start = 17 + 12;
        for i in body_start..original.len() {
            let mut tampered = original.clone();
            tampered[i] ^= 0x01;
            fs::write(&encrypted, &tampered).unwrap();

            let out = tmp.path().join("out.sql");
            let err = manager.decrypt_file(&encrypted, &out).unwrap_err();
            assert_eq!(err.to_string(), "Encryption error: authentication failed");
            assert!(!out.exists(), "no output after failed authentication");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("x.sql");
        fs::write(&plain, b"secret data").unwrap();

        let (encrypted, _) = zero_key_manager().encrypt_file(&plain).unwrap();
        let other = EncryptionManager::new([1u8; 32]);
        let err = other
            .decrypt_file(&encrypted, &tmp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, Error::Encryption(_)));
    }

    #[test]
    fn test_header_validation() {
        let tmp = TempDir::new().unwrap();
        let manager = zero_key_manager();

        let bad_magic = tmp.path().join("bad");
        fs::write(&bad_magic, b"NOPExxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx").unwrap();
        assert!(manager
            .decrypt_file(&bad_magic, &tmp.path().join("o"))
            .is_err());

        let truncated = tmp.path().join("trunc");
        fs::write(&truncated, b"BAKT\x01").unwrap();
        assert!(manager
            .decrypt_file(&truncated, &tmp.path().join("o"))
            .is_err());
    }

    #[test]
    fn test_key_resolution_precedence() {
        // Raw 32 bytes.
        let raw = "0123456789abcdef0123456789abcdef";
        assert_eq!(key_from_string(raw).unwrap(), *raw.as_bytes().first_chunk::<32>().unwrap());

        // 64 hex chars.
        let hexkey = "00".repeat(32);
        assert_eq!(key_from_string(&hexkey).unwrap(), [0u8; 32]);

        // base64: prefix.
        let b64 = format!("base64:{}", BASE64.encode([7u8; 32]));
        assert_eq!(key_from_string(&b64).unwrap(), [7u8; 32]);

        let short = format!("base64:{}", BASE64.encode([7u8; 16]));
        assert!(key_from_string(&short).is_err());

        // Arbitrary strings derive deterministically.
        let a = key_from_string("hunter2").unwrap();
        let b = key_from_string("hunter2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 32]);
    }

    #[test]
    fn test_passphrase_uses_distinct_salt() {
        let literal = key_from_string("correct horse").unwrap();
        let passphrase =
            resolve_key(&KeySource::Passphrase("correct horse".into())).unwrap();
        assert_ne!(literal, passphrase);
    }

    #[test]
    fn test_key_file_resolution() {
        let tmp = TempDir::new().unwrap();
        let key_file = tmp.path().join("key");
        fs::write(&key_file, format!("{}\n", "ab".repeat(32))).unwrap();

        let key = resolve_key(&KeySource::File(key_file)).unwrap();
        assert_eq!(key, [0xabu8; 32]);
    }

    #[test]
    fn test_verify_key_roundtrip() {
        let tmp = TempDir::new().unwrap();
        zero_key_manager().verify_key(tmp.path()).unwrap();
        // Scratch files are cleaned up.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_settings_disabled() {
        let settings = EncryptionSettings {
            enabled: false,
            key_source: None,
        };
        assert!(EncryptionManager::from_settings(&settings)
            .unwrap()
            .is_none());
    }
}
