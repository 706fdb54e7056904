//! Persisting generated images
//!
//! Files are named `<prefix>_<timestamp>_<seed>.png`. The timestamp never
//! goes backwards for a given writer, and files are opened with
//! `create_new`, so two writes can never clobber each other: a clash on the
//! same second and seed gets a `-N` suffix on the timestamp part.

use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::OutputConfig;
use crate::error::{Error, Result};
use crate::request::GenerationRequest;

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: u64,
}

/// A written image. Never deleted by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub meta: ArtifactMeta,
}

pub struct ArtifactWriter {
    directory: PathBuf,
    prefix: String,
    last_timestamp: AtomicI64,
}

impl ArtifactWriter {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            last_timestamp: AtomicI64::new(0),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.directory.clone(), config.prefix.clone())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write `image` as PNG and return its absolute path.
    ///
    /// The image is only borrowed; on `Error::Storage` the caller still owns
    /// it and can retry.
    pub fn write(
        &self,
        image: &RgbImage,
        seed_used: u64,
        request: &GenerationRequest,
    ) -> Result<ArtifactRecord> {
        fs::create_dir_all(&self.directory).map_err(|e| Error::storage(&self.directory, e))?;
        let directory = self
            .directory
            .canonicalize()
            .map_err(|e| Error::storage(&self.directory, e))?;

        let timestamp = self.next_timestamp();
        let path = self.create_unique(&directory, timestamp, seed_used, |file, path| {
            let mut writer = BufWriter::new(file);
            image
                .write_to(&mut writer, ImageFormat::Png)
                .map_err(|e| Error::storage(path, e))?;
            writer.flush().map_err(|e| Error::storage(path, e))
        })?;

        tracing::debug!("Wrote {}", path.display());

        Ok(ArtifactRecord {
            path,
            meta: ArtifactMeta {
                width: request.width,
                height: request.height,
                steps: request.steps,
                seed: seed_used,
            },
        })
    }

    fn create_unique(
        &self,
        directory: &Path,
        timestamp: i64,
        seed: u64,
        encode: impl FnOnce(fs::File, &Path) -> Result<()>,
    ) -> Result<PathBuf> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}_{}_{}.png", self.prefix, timestamp, seed)
            } else {
                format!("{}_{}-{}_{}.png", self.prefix, timestamp, attempt, seed)
            };
            let path = directory.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    if let Err(e) = encode(file, &path) {
                        // Don't leave a truncated PNG behind
                        let _ = fs::remove_file(&path);
                        return Err(e);
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::storage(&path, e)),
            }
        }

        Err(Error::storage(
            directory,
            format!("no free filename for timestamp {} and seed {}", timestamp, seed),
        ))
    }

    /// Unix seconds, clamped so it never decreases for this writer.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp();
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;

    fn request(width: u32, height: u32) -> GenerationRequest {
        GenerationRequest {
            width,
            height,
            ..GenerationRequest::new("sunset over mountains", &GenerationConfig::default())
        }
    }

    #[test]
    fn writes_absolute_png_named_after_seed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path().join("out"), "img");
        let image = RgbImage::new(32, 16);

        let record = writer.write(&image, 42, &request(32, 16)).unwrap();

        assert!(record.path.is_absolute());
        let name = record.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("img_"), "{}", name);
        assert!(name.ends_with("_42.png"), "{}", name);
        assert_eq!(
            record.meta,
            ArtifactMeta {
                width: 32,
                height: 16,
                steps: 5,
                seed: 42
            }
        );

        let decoded = image::open(&record.path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn repeated_writes_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "img");
        let image = RgbImage::new(16, 16);
        let req = request(16, 16);

        let mut paths = std::collections::HashSet::new();
        for _ in 0..20 {
            let record = writer.write(&image, 7, &req).unwrap();
            assert!(record.path.to_str().unwrap().ends_with("_7.png"));
            assert!(paths.insert(record.path));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 20);
    }

    #[test]
    fn unwritable_directory_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let writer = ArtifactWriter::new(blocker.join("out"), "img");
        let image = RgbImage::new(16, 16);
        let err = writer.write(&image, 1, &request(16, 16)).unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
        // The caller still holds the image and can retry elsewhere
        let retry = ArtifactWriter::new(dir.path().join("ok"), "img");
        assert!(retry.write(&image, 1, &request(16, 16)).is_ok());
    }

    #[test]
    fn timestamps_do_not_decrease() {
        let writer = ArtifactWriter::new("unused", "img");
        writer.last_timestamp.store(i64::MAX - 1, Ordering::SeqCst);
        assert_eq!(writer.next_timestamp(), i64::MAX - 1);
    }
}
