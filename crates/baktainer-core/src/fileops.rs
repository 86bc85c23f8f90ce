//! Filesystem primitives for the backup pipeline.
//!
//! Everything that touches the artifact directory funnels through here:
//! directory creation with a free-space floor, scoped write handles,
//! atomic rename with a cross-device fallback, streaming gzip, sha256
//! checksums, integrity checks, best-effort cleanup, and sidecar
//! metadata.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Free space required before a backup directory is usable.
pub const MIN_DIR_FREE_BYTES: u64 = 100 * 1024 * 1024;

const IO_CHUNK: usize = 64 * 1024;

/// Capability probing free bytes on the filesystem holding `path`.
///
/// `None` means the probe could not answer; callers assume "enough" and
/// log a warning.
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// Stat-based probe backed by sysinfo's disk list.
pub struct SystemProbe;

impl SpaceProbe for SystemProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Fallback probe shelling out to a portable `df -Pk`.
pub struct CommandProbe;

impl SpaceProbe for CommandProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let output = Command::new("df").arg("-Pk").arg(path).output().ok()?;
        if !output.status.success() {
            return None;
        }
        parse_df_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// POSIX `df -P` output: header line, then one data line whose fourth
/// column is available 1K blocks.
fn parse_df_output(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    let available_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(available_kb * 1024)
}

/// Probe chain selected at runtime: stat first, external command second.
pub struct ChainProbe {
    probes: Vec<Box<dyn SpaceProbe>>,
}

impl ChainProbe {
    pub fn new(probes: Vec<Box<dyn SpaceProbe>>) -> Self {
        Self { probes }
    }
}

impl SpaceProbe for ChainProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        self.probes.iter().find_map(|p| p.free_space(path))
    }
}

/// The default probe chain.
pub fn default_probe() -> ChainProbe {
    ChainProbe::new(vec![Box::new(SystemProbe), Box::new(CommandProbe)])
}

/// Create a backup directory recursively, requiring it to be writable
/// and its filesystem to have at least [`MIN_DIR_FREE_BYTES`] free.
pub fn create_backup_dir(path: &Path, probe: &dyn SpaceProbe) -> Result<()> {
    fs::create_dir_all(path)?;

    // Writability check: actually touch the filesystem.
    let probe_file = path.join(".baktainer-write-check");
    File::create(&probe_file)
        .and_then(|_| fs::remove_file(&probe_file))
        .map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("backup directory '{}' is not writable: {e}", path.display()),
            ))
        })?;

    match probe.free_space(path) {
        Some(free) if free < MIN_DIR_FREE_BYTES => Err(Error::Io(io::Error::other(format!(
            "insufficient space in '{}': {free} bytes free, {MIN_DIR_FREE_BYTES} required",
            path.display()
        )))),
        Some(_) => Ok(()),
        None => {
            warn!(path = %path.display(), "free-space probe unavailable, assuming enough");
            Ok(())
        }
    }
}

/// Scoped acquisition of a buffered write handle. The handle is flushed
/// and fsynced on success and closed on every exit path.
pub fn write<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    f(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Existence plus non-zero size; returns the size.
pub fn verify_created(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|e| {
        Error::Integrity(format!("backup file '{}' was not created: {e}", path.display()))
    })?;
    if metadata.len() == 0 {
        return Err(Error::Integrity(format!(
            "backup file '{}' is empty",
            path.display()
        )));
    }
    Ok(metadata.len())
}

/// Atomic rename within a filesystem; copy-then-unlink across devices.
pub fn rename(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %rename_err,
                "rename failed, falling back to copy+unlink"
            );
            fs::copy(src, dst).map_err(|e| {
                Error::Io(io::Error::new(
                    e.kind(),
                    format!("cross-device copy to '{}' failed: {e}", dst.display()),
                ))
            })?;
            fs::remove_file(src)?;
            Ok(())
        }
    }
}

/// Stream-gzip `src` into `dst`; unlink `src` on success.
pub fn compress(src: &Path, dst: &Path) -> Result<()> {
    let input = File::open(src)?;
    let mut reader = BufReader::new(input);
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());

    io::copy(&mut reader, &mut encoder)?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("gzip stream failed: {e}")))?
        .flush()?;

    fs::remove_file(src)?;
    Ok(())
}

/// Streaming sha256, hex-encoded.
pub fn checksum(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Result of [`verify_integrity`].
#[derive(Debug, Clone)]
pub struct IntegrityInfo {
    pub size: u64,
    pub checksum: String,
    pub compressed: bool,
}

/// Verify a published artifact: size floor (10 bytes plain, 20 bytes
/// gzipped) and a recomputed checksum.
pub fn verify_integrity(path: &Path) -> Result<IntegrityInfo> {
    let compressed = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".gz"))
        .unwrap_or(false);
    let min_size = if compressed { 20 } else { 10 };

    let size = fs::metadata(path)?.len();
    if size < min_size {
        return Err(Error::Integrity(format!(
            "artifact '{}' is {size} bytes, below the {min_size}-byte minimum",
            path.display()
        )));
    }

    Ok(IntegrityInfo {
        size,
        checksum: checksum(path)?,
        compressed,
    })
}

/// Best-effort deletion; warns on failure, never errors.
pub fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed leftover file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
        }
    }
}

/// Sidecar path for an artifact: `<artifact>.meta`.
pub fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".meta");
    PathBuf::from(name)
}

/// Write a one-line JSON sidecar beside `path`. Sidecar failure is a
/// warning, never fatal.
pub fn write_metadata<T: Serialize>(path: &Path, metadata: &T) {
    let target = meta_path(path);
    let result = serde_json::to_string(metadata)
        .map_err(Error::from)
        .and_then(|json| write(&target, |w| Ok(w.write_all(json.as_bytes())?)));
    if let Err(e) = result {
        warn!(path = %target.display(), error = %e, "failed to write metadata sidecar");
    }
}
