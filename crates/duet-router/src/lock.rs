use std::path::Path;
use std::sync::Arc;

/// Cross-process mutual exclusion around the shared local inference host.
///
/// `try_acquire` is non-blocking; callers poll with their own deadline so a
/// routing decision is always bounded ("acquired" or "busy"). The lock file
/// also carries one instance-id line per current holder, so a plain reader
/// can count who believes it holds the lock.
pub trait SystemLock: Send + Sync {
    fn try_acquire(&self) -> anyhow::Result<bool>;
    fn release(&self);
    fn holder_count(&self) -> usize;
}

/// Pick the real advisory lock where the platform supports it. Elsewhere the
/// no-op stands in and the missing exclusion is logged, not hidden.
pub fn lock_for_platform(path: &Path, instance_id: &str) -> Arc<dyn SystemLock> {
    #[cfg(unix)]
    {
        Arc::new(FileLock::new(path, instance_id))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, instance_id);
        tracing::warn!(
            "advisory file locking is unsupported on this platform; cross-process exclusion is disabled"
        );
        Arc::new(NoopLock)
    }
}

#[cfg(unix)]
pub use file_lock::FileLock;

#[cfg(unix)]
mod file_lock {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use fs2::FileExt;

    use super::SystemLock;

    pub struct FileLock {
        path: PathBuf,
        instance_id: String,
        held: Mutex<Option<File>>,
    }

    impl FileLock {
        pub fn new(path: impl AsRef<Path>, instance_id: impl Into<String>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
                instance_id: instance_id.into(),
                held: Mutex::new(None),
            }
        }

        fn rewrite(file: &File, lines: &[String]) -> std::io::Result<()> {
            let mut handle = file;
            handle.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            for line in lines {
                writeln!(handle, "{}", line)?;
            }
            handle.flush()
        }

        fn read_lines(file: &File) -> std::io::Result<Vec<String>> {
            let mut handle = file;
            handle.seek(SeekFrom::Start(0))?;
            let mut contents = String::new();
            handle.read_to_string(&mut contents)?;
            Ok(contents
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect())
        }
    }

    impl SystemLock for FileLock {
        fn try_acquire(&self) -> anyhow::Result<bool> {
            let mut held = self.held.lock().unwrap_or_else(|poison| poison.into_inner());
            if held.is_some() {
                return Ok(true);
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            if let Err(err) = file.try_lock_exclusive() {
                if err.kind() == fs2::lock_contended_error().kind() {
                    return Ok(false);
                }
                return Err(err.into());
            }

            // Record our holdership while the flock is ours; a torn list is
            // impossible because only the holder writes.
            let mut lines = Self::read_lines(&file)?;
            if !lines.iter().any(|line| line == &self.instance_id) {
                lines.push(self.instance_id.clone());
            }
            Self::rewrite(&file, &lines)?;

            *held = Some(file);
            Ok(true)
        }

        fn release(&self) {
            let mut held = self.held.lock().unwrap_or_else(|poison| poison.into_inner());
            let Some(file) = held.take() else {
                return;
            };

            match Self::read_lines(&file) {
                Ok(lines) => {
                    let remaining: Vec<String> = lines
                        .into_iter()
                        .filter(|line| line != &self.instance_id)
                        .collect();
                    if let Err(err) = Self::rewrite(&file, &remaining) {
                        tracing::warn!(
                            "could not clear instance id from {}: {}",
                            self.path.display(),
                            err
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!("could not read lock file {}: {}", self.path.display(), err);
                }
            }

            if let Err(err) = FileExt::unlock(&file) {
                tracing::warn!("could not release system lock: {}", err);
            }
        }

        fn holder_count(&self) -> usize {
            match std::fs::read_to_string(&self.path) {
                Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
                Err(_) => 0,
            }
        }
    }

    impl Drop for FileLock {
        fn drop(&mut self) {
            self.release();
        }
    }
}

/// Explicit stand-in where advisory locking is unavailable. Every acquire
/// succeeds; the safety gap lives here on purpose rather than in a silently
/// skipped branch.
pub struct NoopLock;

impl SystemLock for NoopLock {
    fn try_acquire(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn release(&self) {}

    fn holder_count(&self) -> usize {
        0
    }
}
