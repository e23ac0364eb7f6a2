use std::convert::TryInto;
use std::env;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::mem::{ManuallyDrop, MaybeUninit};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};

use getrandom::getrandom;
use libc::c_int;
use log::{debug, warn};

use crate::error::{Error, Result};

/// The byte written for each pool token. Make writes `+`, some tools
/// write `|`; consumers must treat whatever they read as opaque.
const TOKEN: u8 = b'+';

#[derive(Debug)]
pub(super) struct Client {
    /// Non-inheritable, non-blocking duplicate of the pool's read end.
    read: File,
    /// Non-inheritable, non-blocking duplicate of the pool's write end.
    write: File,
}

impl Client {
    /// `--jobserver-auth=R,W`
    ///
    /// The original descriptors stay untouched so children inherit the
    /// blocking, inheritable endpoints; this client polls private
    /// duplicates.
    pub(super) unsafe fn from_fds(read: c_int, write: c_int) -> Result<Client> {
        let read = ManuallyDrop::new(File::from_raw_fd(read));
        let write = ManuallyDrop::new(File::from_raw_fd(write));

        // If make runs our rule without a leading `+` we inherit the
        // MAKEFLAGS text but not the descriptors, so check that the
        // integers really are a readable and a writable pipe before
        // touching them.
        check_is_fifo(&read, "jobserver read descriptor")?;
        check_is_fifo(&write, "jobserver write descriptor")?;
        check_access_mode(&read, libc::O_RDONLY, "jobserver read descriptor")?;
        check_access_mode(&write, libc::O_WRONLY, "jobserver write descriptor")?;

        let client = Client {
            read: dup_private(&read, "jobserver read descriptor")?,
            write: dup_private(&write, "jobserver write descriptor")?,
        };
        debug!(
            "jobserver client attached to descriptor pair {},{}",
            read.as_raw_fd(),
            write.as_raw_fd()
        );
        Ok(client)
    }

    /// `--jobserver-auth=fifo:PATH`
    pub(super) fn from_fifo(path: &Path) -> Result<Client> {
        let read = open_fifo_half(path, false)?;
        // A non-blocking write-only open of a fifo fails with ENXIO
        // until a reader exists, so the read side goes first.
        let write = open_fifo_half(path, true)?;
        check_is_fifo(&read, "jobserver fifo")?;
        debug!("jobserver client attached to fifo {}", path.display());
        Ok(Client { read, write })
    }

    /// One non-blocking read of one token byte. Interrupted reads are
    /// retried; an empty pool or a read error reports no token.
    pub(super) fn try_acquire(&self) -> Option<u8> {
        let mut buf = [0];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(1) => return Some(buf[0]),
                Ok(_) => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    warn!("jobserver token read failed: {}", e);
                    return None;
                }
            }
        }
    }

    /// Writes the token byte back, retrying on signal interruption.
    /// A failed release loses the token; the protocol offers nothing
    /// better, so the error is only logged.
    pub(super) fn release(&self, byte: u8) {
        loop {
            match (&self.write).write(&[byte]) {
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("jobserver token release failed: {}", e);
                    return;
                }
            }
        }
    }

    pub(super) fn available(&self) -> io::Result<usize> {
        fionread(&self.read)
    }
}

#[derive(Debug)]
pub(super) struct Pool {
    /// Deliberately blocking and inheritable: children use the
    /// original endpoints directly.
    read: File,
    write: File,
    /// Fifo node to unlink on drop, if this pool created one.
    path: Option<PathBuf>,
    env_fragment: String,
    slots: usize,
}

impl Pool {
    pub(super) fn new_pipe(slots: usize) -> Result<Pool> {
        let mut fds = [0 as c_int; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })
            .map_err(|e| Error::endpoint("jobserver pipe", e))?;
        let env_fragment = format!(
            " -j{0} --jobserver-fds={1},{2} --jobserver-auth={1},{2}",
            slots, fds[0], fds[1]
        );
        let pool = Pool {
            read: unsafe { File::from_raw_fd(fds[0]) },
            write: unsafe { File::from_raw_fd(fds[1]) },
            path: None,
            env_fragment,
            slots,
        };
        pool.fill(slots - 1)?;
        debug!("created {}-slot pipe jobserver pool", slots);
        Ok(pool)
    }

    pub(super) fn new_fifo(slots: usize) -> Result<Pool> {
        let (file, path) =
            create_fifo().map_err(|e| Error::endpoint("jobserver fifo creation", e))?;
        let env_fragment = format!(" -j{} --jobserver-auth=fifo:{}", slots, path.display());
        let pool = Pool {
            read: file
                .try_clone()
                .map_err(|e| Error::endpoint("jobserver fifo", e))?,
            write: file,
            path: Some(path),
            env_fragment,
            slots,
        };
        pool.fill(slots - 1)?;
        debug!(
            "created {}-slot fifo jobserver pool at {}",
            slots,
            pool.path.as_ref().unwrap().display()
        );
        Ok(pool)
    }

    /// Buffers `tokens` token bytes in the pool.
    fn fill(&self, tokens: usize) -> Result<()> {
        const BUFFER: [u8; 128] = [TOKEN; 128];

        let mut left = tokens;
        while left > 0 {
            let n = left.min(BUFFER.len());
            (&self.write)
                .write_all(&BUFFER[..n])
                .map_err(|e| Error::endpoint("jobserver token fill", e))?;
            left -= n;
        }
        Ok(())
    }

    pub(super) fn env_fragment(&self) -> &str {
        &self.env_fragment
    }

    pub(super) fn slots(&self) -> usize {
        self.slots
    }

    pub(super) fn available(&self) -> io::Result<usize> {
        fionread(&self.read)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = fs::remove_file(path) {
                debug!("failed to remove jobserver fifo {}: {}", path.display(), e);
            }
        }
    }
}

/// Creates a uniquely named fifo under `$TMPDIR` (or `/tmp`) and opens
/// it read-write, which keeps the node's buffered tokens alive while
/// no worker has it open.
fn create_fifo() -> io::Result<(File, PathBuf)> {
    let tmpdir = env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    let mut name = format!("jobcrew-pool-{}", std::process::id());
    for _ in 0..100 {
        let path = tmpdir.join(&name);
        match mkfifo(&path) {
            Ok(()) => {
                let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
                return Ok((file, path));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // Stale node from a recycled pid; retry with a random
                // suffix.
                let mut bytes = [0u8; 8];
                getrandom(&mut bytes)?;
                name = format!(
                    "jobcrew-pool-{}-{:x}",
                    std::process::id(),
                    u64::from_ne_bytes(bytes)
                );
            }
            Err(err) => return Err(err),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "failed to find a unique name for a fifo",
    ))
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // 0666 matches make's own fifo: workers under another uid must be
    // able to read and write tokens.
    cvt(unsafe { libc::mkfifo(path.as_ptr(), 0o666) }).map(drop)
}

fn open_fifo_half(path: &Path, write: bool) -> Result<File> {
    fs::OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| {
            Error::endpoint(
                format!(
                    "opening jobserver fifo {} for {}",
                    path.display(),
                    if write { "writing" } else { "reading" }
                ),
                e,
            )
        })
}

fn dup_private(file: &File, context: &str) -> Result<File> {
    // 3 keeps the duplicate clear of the stdio descriptors.
    let fd = cvt(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) })
        .map_err(|e| Error::endpoint(context, e))?;
    let dup = unsafe { File::from_raw_fd(fd) };
    let flags = cvt(unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFL) })
        .map_err(|e| Error::endpoint(context, e))?;
    cvt(unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })
        .map_err(|e| Error::endpoint(context, e))?;
    Ok(dup)
}

fn check_is_fifo(file: &File, context: &str) -> Result<()> {
    let meta = file
        .metadata()
        .map_err(|e| Error::endpoint(context, e))?;
    if meta.file_type().is_fifo() {
        Ok(())
    } else {
        Err(Error::endpoint(
            context,
            io::Error::new(io::ErrorKind::InvalidInput, "not a pipe"),
        ))
    }
}

fn check_access_mode(file: &File, want: c_int, context: &str) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) })
        .map_err(|e| Error::endpoint(context, e))?;
    let mode = flags & libc::O_ACCMODE;
    if mode == want || mode == libc::O_RDWR {
        Ok(())
    } else {
        Err(Error::endpoint(
            context,
            io::Error::new(io::ErrorKind::InvalidInput, "wrong access mode"),
        ))
    }
}

fn fionread(file: &File) -> io::Result<usize> {
    let mut len = MaybeUninit::<c_int>::uninit();
    cvt(unsafe { libc::ioctl(file.as_raw_fd(), libc::FIONREAD, len.as_mut_ptr()) })?;
    Ok(unsafe { len.assume_init() }.try_into().unwrap())
}

fn cvt(t: c_int) -> io::Result<c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}
