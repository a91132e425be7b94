use std::io;
use std::path::{Path, PathBuf};

use crate::jobs::JobId;

const SOURCE_PREFIX: &str = "source_";

/// Working directory shared by uploads and derived audio.
///
/// Each job owns the subdirectory `{root}/{job_id}/`. The staged upload is
/// stored there as `source_{filename}`; derived files use fixed names that
/// never carry that prefix, so an upload cannot collide with them.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    /// Make sure the job's directory exists and return it
    pub fn prepare(&self, job_id: &JobId) -> io::Result<PathBuf> {
        let dir = self.job_dir(job_id);
        fs_err::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where the staged upload of a job lives
    pub fn source_path(&self, job_id: &JobId, filename: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("{}{}", SOURCE_PREFIX, filename))
    }

    /// Where a file derived from the source (audio, chunks) lives
    pub fn artifact_path(&self, job_id: &JobId, name: &str) -> PathBuf {
        self.job_dir(job_id).join(name)
    }

    /// Start tracking files for one job attempt
    pub fn tracker(&self, job_id: &JobId) -> ArtifactTracker {
        ArtifactTracker {
            job_dir: self.job_dir(job_id),
            paths: Vec::new(),
        }
    }
}

/// Files to delete once a job attempt ends, however it ends.
///
/// `cleanup` runs on drop as well, so an attempt abandoned mid-await (hard
/// time limit) still leaves nothing behind.
#[derive(Debug)]
pub struct ArtifactTracker {
    job_dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl ArtifactTracker {
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Delete one tracked file right away
    pub fn remove_now(&mut self, path: &Path) {
        self.paths.retain(|tracked| tracked != path);
        remove_quietly(path);
    }

    /// Delete every tracked file, then the job's own directory with anything
    /// a crashed attempt left in it. Failures are logged, never returned.
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            remove_quietly(&path);
        }

        match fs_err::remove_dir_all(&self.job_dir) {
            Ok(()) => tracing::debug!(dir = %self.job_dir.display(), "Removed job directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "Failed to remove job directory"),
        }
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for ArtifactTracker {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_quietly(path: &Path) {
    match fs_err::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(id: &str) -> JobId {
        id.parse().unwrap()
    }

    #[test]
    fn test_paths_are_namespaced_by_job() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path().join("scratch")).unwrap();
        let id = job("abc");

        assert_eq!(scratch.artifact_path(&id, "audio.mp3"), scratch.root().join("abc").join("audio.mp3"));
        assert_eq!(
            scratch.source_path(&id, "talk.mp4"),
            scratch.root().join("abc").join("source_talk.mp4")
        );
    }

    #[test]
    fn test_upload_named_like_derived_file_stays_distinct() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path()).unwrap();
        let id = job("abc");

        for name in ["audio.mp3", "chunk_0.mp3"] {
            assert_ne!(scratch.source_path(&id, name), scratch.artifact_path(&id, name));
        }
    }

    #[test]
    fn test_drop_removes_tracked_files_and_job_dir_only() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path()).unwrap();
        let id = job("job7");
        let other = job("job8");
        scratch.prepare(&id).unwrap();
        scratch.prepare(&other).unwrap();

        let audio = scratch.artifact_path(&id, "audio.mp3");
        let leftover = scratch.artifact_path(&id, "chunk_3.mp3");
        let unrelated = scratch.artifact_path(&other, "audio.mp3");
        for path in [&audio, &leftover, &unrelated] {
            fs_err::write(path, b"x").unwrap();
        }

        {
            let mut tracker = scratch.tracker(&id);
            tracker.track(&audio);
            tracker.track(dir.path().join("never-created.mp3"));
        }

        assert!(!audio.exists());
        assert!(!leftover.exists());
        assert!(!scratch.job_dir(&id).exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_cleanup_leaves_job_with_longer_id_alone() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path()).unwrap();
        let short = job("job");
        let longer = job("job_2");
        scratch.prepare(&short).unwrap();
        scratch.prepare(&longer).unwrap();

        let own = scratch.source_path(&short, "clip.mp4");
        let neighbour = scratch.source_path(&longer, "clip.mp4");
        fs_err::write(&own, b"x").unwrap();
        fs_err::write(&neighbour, b"x").unwrap();

        scratch.tracker(&short).cleanup();

        assert!(!own.exists());
        assert!(neighbour.exists(), "cleanup of 'job' touched {}", neighbour.display());
    }

    #[test]
    fn test_tracked_file_outside_scratch_is_removed() {
        let scratch_dir = TempDir::new().unwrap();
        let upload_dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(scratch_dir.path()).unwrap();
        let upload = upload_dir.path().join("upload.mp4");
        fs_err::write(&upload, b"video").unwrap();

        let mut tracker = scratch.tracker(&job("j"));
        tracker.track(&upload);
        tracker.cleanup();

        assert!(!upload.exists());
        assert!(tracker.tracked().is_empty());
    }

    #[test]
    fn test_remove_now_untracks() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path()).unwrap();
        let id = job("j");
        scratch.prepare(&id).unwrap();
        let chunk = scratch.artifact_path(&id, "chunk_0.mp3");
        fs_err::write(&chunk, b"x").unwrap();

        let mut tracker = scratch.tracker(&id);
        tracker.track(&chunk);
        tracker.remove_now(&chunk);

        assert!(!chunk.exists());
        assert!(tracker.tracked().is_empty());
        assert!(scratch.job_dir(&id).exists());
    }
}
