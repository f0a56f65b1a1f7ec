//! Locked load/store transactions over the backing file.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::db::PersistentData;
use crate::errors::{DbError, DbResult};
use crate::signals::SignalMasker;

use super::guard::ReentrancyGuard;

/// Mode bits for a backing file created on first open.
const BACKING_FILE_MODE: u32 = 0o640;

/// Typed transaction wrapper over a single backing file holding a serialized
/// [`PersistentData`] record.
///
/// Each transaction opens the file (creating it if absent), takes a whole-file
/// advisory lock with flock(2), reads and deserializes the record, and runs
/// the caller's task over it. Exclusive transactions additionally rewrite the
/// file when the task succeeds; the rewrite happens under a full signal mask
/// so INT/HUP/TERM cannot leave a torn file behind. Closing the fd releases
/// the lock on every exit path.
///
/// Coordination is strictly among processes on the same host sharing the
/// same backing file; processes that do not take the lock are not blocked.
pub struct DataViewer {
    backing_file: PathBuf,
    // Threads currently inside a transaction on this viewer.
    held_by: Mutex<HashSet<ThreadId>>,
}

impl DataViewer {
    pub fn new(backing_file: impl Into<PathBuf>) -> Self {
        DataViewer {
            backing_file: backing_file.into(),
            held_by: Mutex::new(HashSet::new()),
        }
    }

    /// Runs `task` over the current record under a shared lock.
    ///
    /// Concurrent shared transactions may overlap; exclusive transactions are
    /// excluded for the duration. Errors from any step before the task are
    /// returned without invoking it; errors from the task propagate unchanged.
    pub fn with_shared_lock<R>(
        &self,
        task: impl FnOnce(&PersistentData) -> DbResult<R>,
    ) -> DbResult<R> {
        let _guard = ReentrancyGuard::enter(&self.held_by);
        let mut file = self.open_backing_file()?;
        flock(&file, libc::LOCK_SH)?;
        let data = load(&mut file)?;
        tracing::trace!(path = %self.backing_file.display(), "shared transaction");
        task(&data)
        // `file` drops here, releasing the lock.
    }

    /// Runs `task` over the current record under an exclusive lock, rewriting
    /// the backing file if the task succeeds.
    ///
    /// When the task returns an error the file is left byte-identical to its
    /// pre-transaction state. A failure during the rewrite itself may leave
    /// the file empty or partial; readers treat an empty file as an empty
    /// record, and the signal masker closes the only window in which
    /// INT/HUP/TERM could otherwise kill the process mid-write.
    pub fn with_exclusive_lock<R>(
        &self,
        task: impl FnOnce(&mut PersistentData) -> DbResult<R>,
    ) -> DbResult<R> {
        let _guard = ReentrancyGuard::enter(&self.held_by);
        let mut file = self.open_backing_file()?;
        flock(&file, libc::LOCK_EX)?;
        let mut data = load(&mut file)?;
        let result = task(&mut data)?;
        let masker = SignalMasker::block_all();
        let store_result = store(&mut file, &data);
        drop(masker);
        store_result?;
        tracing::trace!(path = %self.backing_file.display(), "exclusive transaction committed");
        Ok(result)
    }

    fn open_backing_file(&self) -> DbResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(BACKING_FILE_MODE)
            .open(&self.backing_file)
            .map_err(|e| {
                DbError::Io(format!(
                    "failed to open backing file {}: {}",
                    self.backing_file.display(),
                    e
                ))
            })
    }
}

/// Takes a whole-file advisory lock, blocking until it is granted.
fn flock(file: &File, operation: libc::c_int) -> DbResult<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc != 0 {
        return Err(DbError::Lock(format!(
            "flock failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Reads the whole file and deserializes it. An empty file is a valid,
/// default-constructed record.
fn load(file: &mut File) -> DbResult<PersistentData> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Ok(PersistentData::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| DbError::Parse(format!("backing file is not parseable: {e}")))
}

/// Truncates and rewrites the whole file. Callers mask signals around this.
fn store(file: &mut File, data: &PersistentData) -> DbResult<()> {
    let bytes = serde_json::to_vec(data)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}
