//! Exclusive lock on a storage root
//!
//! sled refuses a second open of the same database with an opaque I/O error.
//! Taking our own lock first lets a second process fail with the owner's pid.

use super::MailboxResult;
use std::fs::{File, OpenOptions};
use std::path::Path;

const LOCK_FILE: &str = "mesh.lock";

pub(crate) struct StorageLock {
    _file: File,
}

impl StorageLock {
    #[cfg(unix)]
    pub fn acquire(root: &Path) -> MailboxResult<Self> {
        use super::MailboxError;
        use std::io::{Read, Write};
        use std::os::unix::io::AsRawFd;

        let path = root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // SAFETY: the descriptor stays owned by `file` for the whole call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            let owner = match owner.trim().parse::<u32>() {
                Ok(pid) => format!("pid {}", pid),
                Err(_) => "unknown pid".to_string(),
            };
            return Err(MailboxError::StorageLocked {
                path: root.to_path_buf(),
                owner,
            });
        }

        file.set_len(0)?;
        file.write_all(std::process::id().to_string().as_bytes())?;
        file.flush()?;
        Ok(Self { _file: file })
    }

    /// No advisory lock here; sled's own lock still rejects a second open
    #[cfg(not(unix))]
    pub fn acquire(root: &Path) -> MailboxResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        Ok(Self { _file: file })
    }
}
