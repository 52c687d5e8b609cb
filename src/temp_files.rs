//! Ephemeral file lifecycle: unique paths, idempotent removal and age-based sweeps

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const MAX_FILENAME_LEN: usize = 100;
const FALLBACK_FILENAME: &str = "upload";

/// Paths reserved for a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempFileHandle {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// Outcome of a sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct TempFileManager {
    temp_dir: PathBuf,
}

impl TempFileManager {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    /// Create the temp directory if it does not exist yet
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir).await
    }

    /// Reserve input and output paths for an upload. No file is created.
    pub fn allocate(&self, original_filename: &str) -> TempFileHandle {
        let id = format!("{:032x}", rand::random::<u128>());
        let filename = sanitize_filename(original_filename);

        TempFileHandle {
            input_path: self.temp_dir.join(format!("{id}_{filename}")),
            output_path: self.temp_dir.join(format!("{id}_processed.png")),
            id,
        }
    }

    /// Remove a file if it exists. Errors are logged and never returned.
    ///
    /// Returns true when a file was actually deleted.
    pub fn cleanup(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed temp file {}", path.display());
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Failed to remove temp file {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Regular files in the temp directory last modified more than `max_age` ago
    pub async fn expired_files(&self, max_age: Duration) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut expired = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let modified = match metadata.modified() {
                Ok(m) => m,
                Err(_) => continue,
            };

            // A modification time in the future is never old enough
            if let Ok(age) = now.duration_since(modified) {
                if age > max_age {
                    expired.push(entry.path());
                }
            }
        }

        Ok(expired)
    }

    /// Delete every regular file older than `max_age`.
    ///
    /// Files younger than `max_age` are never touched, so an in-flight request
    /// is safe as long as `max_age` exceeds the longest request.
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        let candidates = match self.expired_files(max_age).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    "Failed to scan temp directory {}: {}",
                    self.temp_dir.display(),
                    e
                );
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for path in candidates {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                // Removed concurrently by its own request
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Sweep failed to remove {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                "Temp sweep of {}: removed {}, failed {}",
                self.temp_dir.display(),
                report.removed,
                report.failed
            );
        }
        report
    }
}

/// Keep only the final path component and replace anything outside `[A-Za-z0-9._-]`
fn sanitize_filename(original: &str) -> String {
    let name = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.len() > MAX_FILENAME_LEN {
        // Keep the tail so the extension survives
        cleaned = cleaned[cleaned.len() - MAX_FILENAME_LEN..].to_string();
    }

    if cleaned.trim_matches('.').is_empty() {
        return FALLBACK_FILENAME.to_string();
    }
    cleaned
}

/// Scoped ownership of a staged file: removed when dropped.
///
/// Dropping happens on every exit path, including cancellation of the request
/// future when the client disconnects. Inside a runtime the unlink runs on the
/// blocking pool; the periodic sweep catches anything lost at shutdown.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    manager: Arc<TempFileManager>,
}

impl StagedFile {
    pub fn new(path: PathBuf, manager: Arc<TempFileManager>) -> Self {
        Self { path, manager }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                handle.spawn_blocking(move || manager.cleanup(&path));
            }
            Err(_) => {
                self.manager.cleanup(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_allocate_unique_paths() {
        let manager = TempFileManager::new("/tmp/photoid-test");
        let a = manager.allocate("portrait.jpg");
        let b = manager.allocate("portrait.jpg");

        assert_ne!(a.id, b.id);
        assert_ne!(a.input_path, b.input_path);
        assert_eq!(a.id.len(), 32);
        assert!(a.input_path.starts_with("/tmp/photoid-test"));
        assert!(a
            .input_path
            .to_string_lossy()
            .ends_with(&format!("{}_portrait.jpg", a.id)));
        assert!(a
            .output_path
            .to_string_lossy()
            .ends_with(&format!("{}_processed.png", a.id)));
    }

    #[test]
    fn test_allocate_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = TempFileManager::new(dir.path());
        let handle = manager.allocate("a.png");
        assert!(!handle.input_path.exists());
        assert!(!handle.output_path.exists());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\photos\\me.jpg"), "me.jpg");
        assert_eq!(sanitize_filename("my photo (1).jpg"), "my_photo__1_.jpg");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename(".."), "upload");

        let long = format!("{}.jpg", "a".repeat(300));
        let cleaned = sanitize_filename(&long);
        assert_eq!(cleaned.len(), MAX_FILENAME_LEN);
        assert!(cleaned.ends_with(".jpg"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = TempFileManager::new(dir.path());
        let path = dir.path().join("x.jpg");
        std::fs::write(&path, b"data").unwrap();

        assert!(manager.cleanup(&path));
        assert!(!path.exists());
        assert!(!manager.cleanup(&path));
        assert!(!manager.cleanup(&dir.path().join("never-created.png")));
    }

    #[test]
    fn test_staged_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(TempFileManager::new(dir.path()));
        let path = dir.path().join("staged.jpg");
        std::fs::write(&path, b"data").unwrap();

        {
            let staged = StagedFile::new(path.clone(), manager.clone());
            assert!(staged.path().exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staged_file_removed_off_runtime_thread() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(TempFileManager::new(dir.path()));
        let path = dir.path().join("staged.png");
        tokio::fs::write(&path, b"data").await.unwrap();

        drop(StagedFile::new(path.clone(), manager));

        let mut removed = false;
        for _ in 0..100 {
            if !path.exists() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);
    }

    #[tokio::test]
    async fn test_sweep_only_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let manager = TempFileManager::new(dir.path());
        let max_age = Duration::from_secs(3600);

        let old = dir.path().join("old.jpg");
        let fresh = dir.path().join("fresh.jpg");
        let nearly = dir.path().join("nearly.jpg");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"fresh").unwrap();
        std::fs::write(&nearly, b"nearly").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        age_file(&old, Duration::from_secs(7200));
        age_file(&nearly, Duration::from_secs(3500));

        let report = manager.sweep(max_age).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(nearly.exists());
        assert!(dir.path().join("subdir").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_directory() {
        let dir = TempDir::new().unwrap();
        let manager = TempFileManager::new(dir.path().join("absent"));
        assert_eq!(manager.sweep(Duration::ZERO).await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_expired_files_lists_candidates() {
        let dir = TempDir::new().unwrap();
        let manager = TempFileManager::new(dir.path());
        let old = dir.path().join("old.png");
        std::fs::write(&old, b"old").unwrap();
        age_file(&old, Duration::from_secs(120));

        let expired = manager.expired_files(Duration::from_secs(60)).await.unwrap();
        assert_eq!(expired, vec![old.clone()]);
        assert!(old.exists());
    }
}
