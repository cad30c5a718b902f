use anyhow::{anyhow, Result as AnyResult};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::fingerprint::{self, FileStat};
use super::kinds::FileKind;
use crate::config::DuplicateConfig;
use crate::db::assets::{self, HashCandidate, HashState};
use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashReport {
    pub hashed: usize,
    pub failed: usize,
    /// Files that changed on disk since they were indexed; left pending.
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Hashed {
    Done {
        content: String,
        perceptual: Option<String>,
    },
    Failed,
    Stale,
}

/// SHA-256 of the file contents, lowercase hex.
pub fn content_hash(path: &Path, chunk_bytes: usize) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = vec![0u8; chunk_bytes.max(4096)];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Gradient hash of a 64px thumbnail, base64-encoded. `None` when the
/// file does not decode as an image.
pub fn perceptual_hash(path: &Path) -> Option<String> {
    match calculate_perceptual_hash(path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No perceptual hash");
            None
        }
    }
}

fn calculate_perceptual_hash(path: &Path) -> AnyResult<String> {
    use img_hash::HasherConfig;

    let img = image::open(path)?;
    let thumbnail = img.thumbnail(64, 64);

    let hasher = HasherConfig::new().hash_size(16, 16).to_hasher();

    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();
    let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));
    Ok(hash.to_base64())
}

/// The file's fingerprint now, if it can be stat'ed.
fn current_fingerprint(candidate: &HashCandidate) -> Option<String> {
    FileStat::read(&candidate.filepath)
        .ok()
        .map(|stat| fingerprint::fingerprint_stat(&candidate.path_key, &stat))
}

fn hash_candidate(candidate: &HashCandidate, chunk_bytes: usize) -> Hashed {
    match current_fingerprint(candidate) {
        Some(fp) if fp == candidate.fingerprint => {}
        Some(_) => return Hashed::Stale,
        None => return Hashed::Failed,
    }

    let content = match content_hash(&candidate.filepath, chunk_bytes) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::debug!(path = %candidate.filepath.display(), error = %e, "Content hash failed");
            return Hashed::Failed;
        }
    };
    let perceptual = match candidate.kind {
        Some(FileKind::Image) => perceptual_hash(&candidate.filepath),
        _ => None,
    };

    // Bytes read under a different file state must not be recorded.
    if current_fingerprint(candidate).as_deref() != Some(candidate.fingerprint.as_str()) {
        return Hashed::Stale;
    }
    Hashed::Done { content, perceptual }
}

/// Hash every asset still waiting for hashes, `hash_batch` at a time.
///
/// Files are hashed in parallel off the async runtime. A result is only
/// stored if the asset row still carries the fingerprint that was hashed.
pub async fn hash_pending(db: &Database, config: &DuplicateConfig) -> Result<HashReport> {
    let mut report = HashReport::default();
    let mut cursor = 0i64;
    let batch = config.hash_batch.max(1);
    let chunk_bytes = config.hash_chunk_bytes;

    loop {
        let candidates = db
            .call(move |conn| assets::pending_hashes(conn, cursor, batch))
            .await?;
        let Some(last) = candidates.last() else {
            break;
        };
        cursor = last.id;

        let hashed: Vec<(HashCandidate, Hashed)> = tokio::task::spawn_blocking(move || {
            candidates
                .into_par_iter()
                .map(|candidate| {
                    let result = hash_candidate(&candidate, chunk_bytes);
                    (candidate, result)
                })
                .collect()
        })
        .await?;

        let pass = db
            .call(move |conn| {
                let mut pass = HashReport::default();
                for (candidate, result) in &hashed {
                    let recorded = match result {
                        Hashed::Done { content, perceptual } => assets::record_hashes(
                            conn,
                            candidate.id,
                            &candidate.fingerprint,
                            Some(content.as_str()),
                            perceptual.as_deref(),
                            HashState::Done,
                        )?,
                        Hashed::Failed => assets::record_hashes(
                            conn,
                            candidate.id,
                            &candidate.fingerprint,
                            None,
                            None,
                            HashState::Failed,
                        )?,
                        Hashed::Stale => false,
                    };
                    match (result, recorded) {
                        (Hashed::Done { .. }, true) => pass.hashed += 1,
                        (Hashed::Failed, true) => pass.failed += 1,
                        _ => pass.stale += 1,
                    }
                }
                Ok(pass)
            })
            .await?;

        report.hashed += pass.hashed;
        report.failed += pass.failed;
        report.stale += pass.stale;
    }

    tracing::debug!(hashed = report.hashed, failed = report.failed, stale = report.stale, "Hash pass finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use image::{ImageBuffer, Rgb};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn gradient_png(path: &Path) {
        let img = ImageBuffer::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 128u8]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_content_hash_known_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            content_hash(&path, 2).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_perceptual_hash_images_only() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        gradient_png(&a);
        gradient_png(&b);
        let ha = perceptual_hash(&a).unwrap();
        let hb = perceptual_hash(&b).unwrap();
        assert_eq!(crate::db::similarity::hamming_distance(&ha, &hb), Some(0));

        let text = dir.path().join("c.png");
        std::fs::write(&text, b"not an image").unwrap();
        assert!(perceptual_hash(&text).is_none());
    }

    #[test]
    fn test_changed_file_is_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"one").unwrap();
        let candidate = HashCandidate {
            id: 1,
            filepath: path.clone(),
            path_key: fingerprint::path_key(&path),
            fingerprint: "not-the-current-fingerprint".to_string(),
            kind: Some(FileKind::Image),
        };
        assert_eq!(hash_candidate(&candidate, 1024), Hashed::Stale);

        let missing = HashCandidate {
            filepath: PathBuf::from("/definitely/not/here.png"),
            ..candidate
        };
        assert_eq!(hash_candidate(&missing, 1024), Hashed::Failed);
    }

    #[tokio::test]
    async fn test_hash_pending_with_no_assets() {
        let db = test_db();
        let report = hash_pending(&db, &DuplicateConfig::default()).await.unwrap();
        assert_eq!(report, HashReport::default());
    }
}
