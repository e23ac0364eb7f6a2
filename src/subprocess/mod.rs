//! Asynchronous child processes and the event loop supervising them.
//!
//! A [`SubprocessSet`] owns every running [`Subprocess`] and the
//! platform event source their output streams are registered with: a
//! `ppoll` loop over pipe read ends on unix, an I/O completion port
//! fed by overlapped named pipes on windows. One thread drives all
//! progress by calling [`SubprocessSet::do_work`] until the commands
//! it is waiting on turn up in the finished queue.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod imp;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod imp;
    }
}

pub use imp::{Subprocess, SubprocessSet};

/// Final status of a supervised command, from [`Subprocess::finish`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child exited with code 0.
    Success,
    /// The child was torn down by the supervisor's interrupt
    /// propagation (a fatal termination signal on unix, a
    /// `CONTROL_C_EXIT` exit code on windows).
    Interrupted,
    /// The child failed; carries its exit code.
    Failure(i32),
}

impl ExitStatus {
    /// Whether the command succeeded.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

/// Which output stream of a subprocess an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamId {
    Stdout,
    Stderr,
}

/// Captured output of one subprocess.
///
/// `combined` interleaves both streams in arrival order, so its length
/// always equals `stdout.len() + stderr.len()`.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl OutputBuffers {
    /// Appends one contiguous delivery to its stream and to the
    /// combined log.
    pub(crate) fn append(&mut self, which: StreamId, data: &[u8]) {
        match which {
            StreamId::Stdout => self.stdout.extend_from_slice(data),
            StreamId::Stderr => self.stderr.extend_from_slice(data),
        }
        self.combined.extend_from_slice(data);
    }

    pub(crate) fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub(crate) fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub(crate) fn combined(&self) -> &[u8] {
        &self.combined
    }
}
