//! One daemon per machine: a PID-stamped lock file created with exclusive
//! create, reclaimed when its recorded holder is no longer running.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tandem_core::process::{now_ms, pid_is_alive};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "daemon.lock";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// How long a lock file without a readable record is left to its creator.
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOperation {
    Create,
    Read,
    Write,
    Remove,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error while {operation:?} {path:?}: {source}")]
    Io {
        path: PathBuf,
        operation: LockOperation,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub holder_pid: i32,
    pub acquired_at_ms: i64,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            holder_pid: std::process::id() as i32,
            acquired_at_ms: now_ms(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}\n{}", self.holder_pid, self.acquired_at_ms)
    }

    /// Parses `"<pid>\n<timestampMs>"`. A missing timestamp is tolerated; a
    /// missing or non-numeric pid is not.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines();
        let holder_pid = lines.next()?.trim().parse::<i32>().ok()?;
        if holder_pid <= 0 {
            return None;
        }
        let acquired_at_ms = lines
            .next()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .unwrap_or(0);
        Some(Self {
            holder_pid,
            acquired_at_ms,
        })
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockGuard),
    /// Another live process holds the lock.
    Held { pid: i32 },
    /// The lock file was created moments ago and its record is not written
    /// yet. Its creator owns it.
    Starting,
    /// Stale locks kept reappearing; gave up after the retry budget.
    Contended,
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

#[derive(Clone, Debug)]
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lock if no live process holds it. Only the exclusive create
    /// decides ownership; the liveness probe merely decides whether a stale
    /// file may be removed before trying again.
    pub fn try_acquire(&self, max_retries: u32) -> Result<LockOutcome, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                operation: LockOperation::Create,
                source,
            })?;
        }

        let mut reclaimed = 0;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let record = LockRecord::current();
                    let written = file
                        .write_all(record.encode().as_bytes())
                        .and_then(|_| file.sync_all());
                    if let Err(source) = written {
                        let _ = fs::remove_file(&self.path);
                        return Err(LockError::Io {
                            path: self.path.clone(),
                            operation: LockOperation::Write,
                            source,
                        });
                    }
                    info!(
                        event = "lock_acquired",
                        path = %self.path.display(),
                        pid = record.holder_pid,
                        reclaimed = reclaimed
                    );
                    return Ok(LockOutcome::Acquired(LockGuard {
                        lock: self.clone(),
                        record,
                        released: false,
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let existing = self.read_record()?;
                    match &existing {
                        Some(record) if pid_is_alive(record.holder_pid) => {
                            debug!(event = "lock_held", pid = record.holder_pid);
                            return Ok(LockOutcome::Held {
                                pid: record.holder_pid,
                            });
                        }
                        Some(_) => {}
                        None => match self.file_age()? {
                            None => continue,
                            Some(age) if age < UNREADABLE_GRACE => {
                                debug!(event = "lock_starting", path = %self.path.display());
                                return Ok(LockOutcome::Starting);
                            }
                            Some(_) => {}
                        },
                    }
                    if reclaimed >= max_retries {
                        warn!(event = "lock_contended", path = %self.path.display(), attempts = reclaimed);
                        return Ok(LockOutcome::Contended);
                    }
                    reclaimed += 1;
                    warn!(
                        event = "lock_reclaim",
                        path = %self.path.display(),
                        stale_pid = existing.as_ref().map(|record| record.holder_pid).unwrap_or(0),
                        attempt = reclaimed
                    );
                    remove_if_present(&self.path)?;
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        operation: LockOperation::Create,
                        source,
                    })
                }
            }
        }
    }

    /// The current lock record, or `None` when absent or unreadable.
    pub fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(LockRecord::parse(&raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => Ok(None),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                operation: LockOperation::Read,
                source,
            }),
        }
    }

    /// Time since the lock file was last written, `None` once it is gone.
    /// An unknown or future mtime counts as just written.
    fn file_age(&self) -> Result<Option<Duration>, LockError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(
                meta.modified()
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or_default(),
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                operation: LockOperation::Read,
                source,
            }),
        }
    }

    /// Deletes the lock file. Already absent counts as success.
    pub fn release(&self) -> Result<(), LockError> {
        remove_if_present(&self.path)?;
        debug!(event = "lock_released", path = %self.path.display());
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            operation: LockOperation::Remove,
            source,
        }),
    }
}

/// Ownership of the singleton lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    lock: SingletonLock,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_owned()
    }

    fn release_owned(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // Never delete a lock someone else reclaimed in the meantime.
        match self.lock.read_record()? {
            Some(current) if current.holder_pid != self.record.holder_pid => {
                warn!(event = "lock_taken_over", pid = current.holder_pid);
                Ok(())
            }
            _ => self.lock.release(),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).expect("open");
        file.set_modified(std::time::SystemTime::now() - by)
            .expect("set mtime");
    }

    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id() as i32;
        child.wait().expect("wait");
        pid
    }

    #[test]
    fn record_roundtrips_through_text() {
        let record = LockRecord {
            holder_pid: 4242,
            acquired_at_ms: 1_700_000_000_000,
        };
        assert_eq!(record.encode(), "4242\n1700000000000");
        assert_eq!(LockRecord::parse(&record.encode()), Some(record));
        assert_eq!(
            LockRecord::parse("17"),
            Some(LockRecord {
                holder_pid: 17,
                acquired_at_ms: 0
            })
        );
        assert_eq!(LockRecord::parse(""), None);
        assert_eq!(LockRecord::parse("abc\n1"), None);
        assert_eq!(LockRecord::parse("-3\n1"), None);
    }

    #[test]
    fn second_acquire_sees_live_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());

        let first = lock.try_acquire(DEFAULT_MAX_RETRIES).expect("acquire");
        assert!(first.is_acquired());
        let raw = fs::read_to_string(lock.path()).expect("lock file");
        let record = LockRecord::parse(&raw).expect("record");
        assert_eq!(record.holder_pid, std::process::id() as i32);

        match lock.try_acquire(DEFAULT_MAX_RETRIES).expect("second") {
            LockOutcome::Held { pid } => assert_eq!(pid, std::process::id() as i32),
            other => panic!("expected Held, got {other:?}"),
        }
        drop(first);
        assert!(!lock.path().exists());
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());
        let stale = LockRecord {
            holder_pid: dead_pid(),
            acquired_at_ms: 1,
        };
        fs::write(lock.path(), stale.encode()).expect("write stale");

        let outcome = lock.try_acquire(DEFAULT_MAX_RETRIES).expect("acquire");
        let LockOutcome::Acquired(guard) = outcome else {
            panic!("expected Acquired, got {outcome:?}");
        };
        assert_eq!(guard.record().holder_pid, std::process::id() as i32);
        let on_disk = lock.read_record().expect("read").expect("record");
        assert_eq!(on_disk, *guard.record());
        guard.release().expect("release");
        assert!(!lock.path().exists());
    }

    #[test]
    fn old_unreadable_record_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());
        fs::write(lock.path(), "garbage").expect("write garbage");
        backdate(lock.path(), UNREADABLE_GRACE * 2);
        assert!(lock.try_acquire(1).expect("acquire").is_acquired());
    }

    #[test]
    fn freshly_created_empty_lock_is_left_to_its_creator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());
        fs::write(lock.path(), "").expect("create empty");

        assert!(matches!(
            lock.try_acquire(DEFAULT_MAX_RETRIES).expect("acquire"),
            LockOutcome::Starting
        ));
        assert!(lock.path().exists());
        assert_eq!(fs::read_to_string(lock.path()).expect("read"), "");
    }

    #[test]
    fn zero_retry_budget_gives_up_on_stale_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());
        fs::write(lock.path(), format!("{}\n1", dead_pid())).expect("write stale");
        assert!(matches!(
            lock.try_acquire(0).expect("acquire"),
            LockOutcome::Contended
        ));
        assert!(lock.path().exists());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path().join("nested"));
        lock.release().expect("release absent");
        let guard = match lock.try_acquire(DEFAULT_MAX_RETRIES).expect("acquire") {
            LockOutcome::Acquired(guard) => guard,
            other => panic!("expected Acquired, got {other:?}"),
        };
        lock.release().expect("release");
        lock.release().expect("release again");
        guard.release().expect("guard release after file is gone");
    }

    #[test]
    fn guard_leaves_a_lock_reclaimed_by_another_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SingletonLock::new(dir.path());
        let guard = match lock.try_acquire(DEFAULT_MAX_RETRIES).expect("acquire") {
            LockOutcome::Acquired(guard) => guard,
            other => panic!("expected Acquired, got {other:?}"),
        };
        fs::write(lock.path(), "1\n5").expect("overwrite");
        drop(guard);
        assert!(lock.path().exists());
    }
}
