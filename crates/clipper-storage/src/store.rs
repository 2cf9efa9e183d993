//! Date-partitioned artifact store.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/.staging/<job_id>-<uuid>.part      in-flight writes
//! <base>/YYYY-MM-DD/<title>_<job_id>.<ext>   committed clips
//! ```
//!
//! Every write lands in `.staging`, is fsynced and then renamed into its
//! partition, so a reader never observes a partially written clip.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use clipper_models::{is_valid_job_id, sanitize_title, ClipArtifact};

use crate::delivery::{DeliveryConfig, DownloadUrlGenerator};
use crate::error::{StorageError, StorageResult};
use crate::fs_utils::move_file;

const STAGING_DIR: &str = ".staging";
const DATE_FORMAT: &str = "%Y-%m-%d";
const COPY_CHUNK: usize = 64 * 1024;

/// Store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_dir: PathBuf,
    /// Prior daily partitions searched by `get` and `delete`
    pub lookback_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./clips"),
            lookback_days: 7,
        }
    }
}

/// File being written into the staging area, hashed as it goes.
struct StagedFile {
    path: PathBuf,
    file: fs::File,
    hasher: Sha256,
    size: u64,
}

impl StagedFile {
    async fn create(staging_dir: &Path, job_id: &str) -> StorageResult<Self> {
        fs::create_dir_all(staging_dir).await?;
        let path = staging_dir.join(format!("{}-{}.part", job_id, Uuid::new_v4()));
        let file = fs::File::create(&path).await?;
        Ok(Self {
            path,
            file,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush to disk and move into `dst`. Returns `(sha256, size)`.
    async fn commit(mut self, dst: &Path) -> StorageResult<(String, u64)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        move_file(&self.path, dst).await?;
        Ok((hex::encode(self.hasher.finalize()), self.size))
    }
}

/// Local filesystem store for finished clips.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    config: StoreConfig,
    delivery: DownloadUrlGenerator,
}

impl ArtifactStore {
    pub fn new(config: StoreConfig, delivery: DeliveryConfig) -> Self {
        Self {
            config,
            delivery: DownloadUrlGenerator::new(delivery),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    fn staging_dir(&self) -> PathBuf {
        self.config.base_dir.join(STAGING_DIR)
    }

    fn partition_dir(&self, date: NaiveDate) -> PathBuf {
        self.config.base_dir.join(date.format(DATE_FORMAT).to_string())
    }

    /// Persist in-memory clip bytes.
    pub async fn save(
        &self,
        job_id: &str,
        bytes: &[u8],
        title: &str,
        ext: &str,
    ) -> StorageResult<ClipArtifact> {
        check_job_id(job_id)?;
        let mut staged = StagedFile::create(&self.staging_dir(), job_id).await?;
        let staged_path = staged.path.clone();

        let result = async {
            for chunk in bytes.chunks(COPY_CHUNK) {
                staged.write(chunk).await?;
            }
            self.commit(staged, job_id, title, ext, Utc::now()).await
        }
        .await;

        discard_on_error(result, &staged_path).await
    }

    /// Persist a clip file, streaming it through the hasher.
    ///
    /// The source file is left in place.
    pub async fn save_file(&self, job_id: &str, source: &Path, title: &str) -> StorageResult<ClipArtifact> {
        check_job_id(job_id)?;
        let mut input = fs::File::open(source)
            .await
            .map_err(|_| StorageError::not_found(source.display().to_string()))?;
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut staged = StagedFile::create(&self.staging_dir(), job_id).await?;
        let staged_path = staged.path.clone();

        let result = async {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                staged.write(&buf[..n]).await?;
            }
            self.commit(staged, job_id, title, &ext, Utc::now()).await
        }
        .await;

        discard_on_error(result, &staged_path).await
    }

    async fn commit(
        &self,
        staged: StagedFile,
        job_id: &str,
        title: &str,
        ext: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ClipArtifact> {
        if staged.size == 0 {
            return Err(StorageError::write_failed("refusing to store an empty clip"));
        }

        let date = now.date_naive();
        let filename = artifact_filename(title, job_id, ext);
        let dst = self.partition_dir(date).join(&filename);

        let (sha256, byte_size) = staged.commit(&dst).await?;
        let relative_path = format!("{}/{}", date.format(DATE_FORMAT), filename);

        info!(
            job_id = job_id,
            path = %relative_path,
            size = byte_size,
            "Stored clip"
        );

        Ok(ClipArtifact {
            relative_path,
            sha256,
            byte_size,
            filename,
            created_at: now,
        })
    }

    /// Locate a job's clip in today's partition or the configured prior days.
    pub async fn get(&self, job_id: &str) -> StorageResult<Option<PathBuf>> {
        self.get_on(job_id, Utc::now().date_naive()).await
    }

    /// [`ArtifactStore::get`] relative to a given day.
    pub async fn get_on(&self, job_id: &str, today: NaiveDate) -> StorageResult<Option<PathBuf>> {
        check_job_id(job_id)?;
        for date in self.search_dates(today) {
            if let Some(path) = find_in_partition(&self.partition_dir(date), job_id).await?.into_iter().next() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Remove every stored clip of a job within the lookback window.
    pub async fn delete(&self, job_id: &str) -> StorageResult<bool> {
        self.delete_on(job_id, Utc::now().date_naive()).await
    }

    pub async fn delete_on(&self, job_id: &str, today: NaiveDate) -> StorageResult<bool> {
        check_job_id(job_id)?;
        let mut removed = false;
        for date in self.search_dates(today) {
            for path in find_in_partition(&self.partition_dir(date), job_id).await? {
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(job_id = job_id, path = %path.display(), "Deleted clip");
                        removed = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    /// Recompute a file's SHA-256 and compare (case-insensitively) with `expected`.
    pub async fn validate_integrity(&self, path: &Path, expected_sha256: &str) -> StorageResult<bool> {
        let actual = sha256_file(path).await?;
        let matches = actual.eq_ignore_ascii_case(expected_sha256.trim());
        if !matches {
            warn!(path = %path.display(), "Checksum mismatch");
        }
        Ok(matches)
    }

    pub fn get_download_url(&self, job_id: &str, filename: &str) -> StorageResult<String> {
        self.delivery.download_url(job_id, filename)
    }

    pub fn url_generator(&self) -> &DownloadUrlGenerator {
        &self.delivery
    }

    fn search_dates(&self, today: NaiveDate) -> impl Iterator<Item = NaiveDate> {
        (0..=i64::from(self.config.lookback_days)).filter_map(move |d| {
            today.checked_sub_signed(ChronoDuration::days(d))
        })
    }
}

fn check_job_id(job_id: &str) -> StorageResult<()> {
    if is_valid_job_id(job_id) {
        Ok(())
    } else {
        Err(StorageError::InvalidJobId(job_id.to_string()))
    }
}

/// `<sanitized title>_<job_id>.<ext>`, defaulting the extension to `mp4`.
pub fn artifact_filename(title: &str, job_id: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    let ext = if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext.to_ascii_lowercase()
    } else {
        "mp4".to_string()
    };
    format!("{}_{}.{}", sanitize_title(title), job_id, ext)
}

/// Files in `dir` named `*_<job_id>.<ext>`.
async fn find_in_partition(dir: &Path, job_id: &str) -> StorageResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_stem()
            .map_or(false, |stem| stem_job_id(&stem.to_string_lossy()) == Some(job_id));
        if matches && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Job id segment of a `<title>_<job_id>` stem. Ids never contain `_`, so the
/// last separator is the boundary.
fn stem_job_id(stem: &str) -> Option<&str> {
    stem.rsplit_once('_').map(|(_, id)| id)
}

async fn discard_on_error<T>(result: StorageResult<T>, staged_path: &Path) -> StorageResult<T> {
    if result.is_err() {
        if let Err(e) = fs::remove_file(staged_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staged_path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
    result
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub async fn sha256_file(path: &Path) -> StorageResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(
            StoreConfig {
                base_dir: dir.path().to_path_buf(),
                lookback_days: 7,
            },
            DeliveryConfig::default(),
        )
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    async fn plant(dir: &TempDir, date: &str, name: &str) -> PathBuf {
        let partition = dir.path().join(date);
        fs::create_dir_all(&partition).await.unwrap();
        let path = partition.join(name);
        fs::write(&path, b"clip").await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_save_writes_partitioned_file_with_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let artifact = store.save("job-1", b"hello", "My: Clip", "mp4").await.unwrap();

        let today = Utc::now().date_naive().format(DATE_FORMAT).to_string();
        assert_eq!(artifact.filename, "My_ Clip_job-1.mp4");
        assert_eq!(artifact.relative_path, format!("{}/My_ Clip_job-1.mp4", today));
        assert_eq!(artifact.byte_size, 5);
        // sha256("hello")
        assert_eq!(
            artifact.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let stored = dir.path().join(&artifact.relative_path);
        assert_eq!(fs::read(&stored).await.unwrap(), b"hello");
        assert!(store.validate_integrity(&stored, &artifact.sha256).await.unwrap());
        assert!(store
            .validate_integrity(&stored, &artifact.sha256.to_uppercase())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_staging_is_empty_after_save() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save("job-1", b"bytes", "t", "mp4").await.unwrap();

        let mut entries = fs::read_dir(dir.path().join(STAGING_DIR)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.save("job-1", b"", "t", "mp4").await.is_err());
        assert!(store.save("../escape", b"x", "t", "mp4").await.is_err());

        let mut entries = fs::read_dir(dir.path().join(STAGING_DIR)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_file_streams_source() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let source = dir.path().join("clip.mp4");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &payload).await.unwrap();

        let artifact = store.save_file("job-2", &source, "Title").await.unwrap();

        assert!(source.exists(), "source file is left in place");
        assert_eq!(artifact.byte_size, payload.len() as u64);
        assert_eq!(artifact.filename, "Title_job-2.mp4");
        let stored = dir.path().join(&artifact.relative_path);
        assert_eq!(sha256_file(&stored).await.unwrap(), artifact.sha256);
        assert_eq!(sha256_file(&source).await.unwrap(), artifact.sha256);
    }

    #[tokio::test]
    async fn test_save_file_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir)
            .save_file("job-2", &dir.path().join("missing.mp4"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_searches_lookback_window() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let planted = plant(&dir, "2024-05-03", "clip_job-7.mp4").await;
        plant(&dir, "2024-04-20", "old_job-8.mp4").await;

        assert_eq!(store.get_on("job-7", day("2024-05-10")).await.unwrap(), Some(planted));
        // Eight days back is outside the window
        assert_eq!(store.get_on("job-7", day("2024-05-11")).await.unwrap(), None);
        assert_eq!(store.get_on("job-8", day("2024-05-10")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_matches_whole_job_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        plant(&dir, "2024-05-03", "clip_xjob-7.mp4").await;

        assert_eq!(store.get_on("job-7", day("2024-05-03")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_does_not_cross_into_other_jobs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let other = plant(&dir, "2024-05-03", "title_a_1.mp4").await;

        assert_eq!(store.get_on("1", day("2024-05-03")).await.unwrap(), None);
        assert!(!store.delete_on("1", day("2024-05-03")).await.unwrap());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_title_with_separator_still_matches() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let planted = plant(&dir, "2024-05-03", "my_great_clip_job-9.mp4").await;

        assert_eq!(store.get_on("job-9", day("2024-05-03")).await.unwrap(), Some(planted));
        assert!(store.get_on("a_1", day("2024-05-03")).await.is_err());
    }

    #[test]
    fn test_stem_job_id() {
        assert_eq!(stem_job_id("title_a_1"), Some("1"));
        assert_eq!(stem_job_id("clip_job-7"), Some("job-7"));
        assert_eq!(stem_job_id("nojob"), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let planted = plant(&dir, "2024-05-03", "clip_job-7.mp4").await;

        assert!(store.delete_on("job-7", day("2024-05-04")).await.unwrap());
        assert!(!planted.exists());
        assert!(!store.delete_on("job-7", day("2024-05-04")).await.unwrap());
    }

    #[test]
    fn test_artifact_filename() {
        assert_eq!(artifact_filename("a/b", "j", ".MP4"), "a_b_j.mp4");
        assert_eq!(artifact_filename("", "j", ""), "video_j.mp4");
        assert_eq!(artifact_filename("t", "j", "m/4"), "t_j.mp4");
    }

    #[test]
    fn test_download_url() {
        let dir = TempDir::new().unwrap();
        let url = store(&dir).get_download_url("job-1", "t_job-1.mp4").unwrap();
        assert_eq!(url, "http://localhost:8000/clips/job-1/download?filename=t_job-1.mp4");
    }
}
