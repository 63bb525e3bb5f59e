//! Local staging area for artifacts waiting to be uploaded.

use anyhow::{Context, Result};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::core::models::{Job, JobTemplate};

/// Buffer size for hashing staged files
const BUFFER_SIZE: usize = 128 * 1024;

/// Where the staged artifact of `job` lives. Stable for the lifetime of the job.
pub fn staged_path(staging_dir: &Path, template: &JobTemplate, job: &Job) -> PathBuf {
    staging_dir
        .join(&template.slug)
        .join(format!("{}.{}", job.archive_name(template), template.extension()))
}

/// Size of the staged file, `None` if it does not exist.
pub async fn staged_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// Delete the staged file. Returns false when there was nothing to delete.
pub async fn remove_staged(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

pub async fn prepare_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create staging directory {}", parent.display()))?;
    }
    Ok(())
}

/// A content checksum tagged with its algorithm, stored as `algo:hex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    /// As reported by the image service.
    Md5(String),
    /// Computed locally over a streamed dump.
    Blake3(String),
}

impl Checksum {
    pub fn parse(value: &str) -> Option<Self> {
        let (algo, hex) = value.split_once(':')?;
        let hex = hex.to_ascii_lowercase();
        match algo {
            "md5" => Some(Self::Md5(hex)),
            "blake3" => Some(Self::Blake3(hex)),
            _ => None,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5(hex) => write!(f, "md5:{}", hex),
            Self::Blake3(hex) => write!(f, "blake3:{}", hex),
        }
    }
}

/// BLAKE3 of a file, computed on the blocking pool.
pub async fn blake3_file(path: &Path) -> Result<Checksum> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path))
        .await
        .context("Hashing task panicked")?
}

fn hash_file_sync(path: &Path) -> Result<Checksum> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(Checksum::Blake3(hasher.finalize().to_hex().to_string()))
}
