//! Content-addressed archive of raw upstream responses.
//!
//! Layout: `<root>/<source_key>/<year>/<sha256>.json`. Identical bodies for the
//! same source and year land on the same path and are written once.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path(source_key: &str, year: i32, content_hash: &str) -> PathBuf {
        PathBuf::from(source_key)
            .join(year.to_string())
            .join(format!("{content_hash}.json"))
    }

    /// Archives one response body via temp file + rename so readers never see
    /// a partial file.
    pub async fn archive(&self, source_key: &str, year: i32, body: &[u8]) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = Self::relative_path(source_key, year, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = self.root.join(source_key).join(year.to_string());

        let archived = |deduplicated: bool| ArchivedResponse {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: body.len(),
            deduplicated,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Archived bodies for one source and year, sorted by file name.
    pub async fn list(&self, source_key: &str, year: i32) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.root.join(source_key).join(year.to_string());
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Body of the most recently written archive file for one source and
    /// year, if any.
    pub async fn latest(&self, source_key: &str, year: i32) -> anyhow::Result<Option<Vec<u8>>> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for path in self.list(source_key, year).await? {
            let modified = fs::metadata(&path)
                .await
                .and_then(|meta| meta.modified())
                .with_context(|| format!("reading mtime of {}", path.display()))?;
            if newest.as_ref().map_or(true, |(seen, _)| modified >= *seen) {
                newest = Some((modified, path));
            }
        }
        match newest {
            Some((_, path)) => {
                let body = fs::read(&path)
                    .await
                    .with_context(|| format!("reading archived body {}", path.display()))?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }
}
