//! Parsing of the `MAKEFLAGS` fragment that carries jobserver
//! authorization.
//!
//! `make` passes the jobserver down to sub-tools through its flags
//! variable. `--jobserver-auth=` is the documented form;
//! `--jobserver-fds=` is the internal-only legacy alias that only ever
//! carries a descriptor pair. When both appear, or either repeats, the
//! last occurrence wins.

use crate::error::{Error, Result};

/// How a jobserver pool is reached, as advertised in the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobserverConfig {
    /// No jobserver is configured, or it was explicitly disabled.
    None,
    /// Inherited pipe endpoints, `--jobserver-auth=R,W`.
    FileDescriptors {
        /// Read end of the token pipe.
        read: i32,
        /// Write end of the token pipe.
        write: i32,
    },
    /// A named fifo, `--jobserver-auth=fifo:PATH`.
    Fifo(String),
    /// A named Win32 semaphore, `--jobserver-auth=NAME`.
    Win32Semaphore(String),
}

impl JobserverConfig {
    /// Short name of the mode, for diagnostics.
    pub fn mode_name(&self) -> &'static str {
        match self {
            JobserverConfig::None => "none",
            JobserverConfig::FileDescriptors { .. } => "pipe",
            JobserverConfig::Fifo(_) => "fifo",
            JobserverConfig::Win32Semaphore(_) => "semaphore",
        }
    }

    /// Rejects modes this platform cannot serve.
    ///
    /// Pipes and fifos only exist on unix; named semaphores only on
    /// windows. `None` passes everywhere.
    pub fn into_native(self) -> Result<Self> {
        match &self {
            JobserverConfig::FileDescriptors { .. } | JobserverConfig::Fifo(_)
                if cfg!(windows) =>
            {
                Err(Error::UnsupportedMode(self.mode_name()))
            }
            JobserverConfig::Win32Semaphore(_) if !cfg!(windows) => {
                Err(Error::UnsupportedMode(self.mode_name()))
            }
            _ => Ok(self),
        }
    }
}

/// Parses a `MAKEFLAGS`-style string into a [`JobserverConfig`].
///
/// Words are separated by ASCII space or tab. The first word of the
/// variable holds make's single-letter flags without a leading dash;
/// if it contains `n` the whole invocation is a dry run and no token
/// should ever be taken, so the jobserver is reported absent.
///
/// Unknown words are ignored. An empty or whitespace-only string
/// parses to [`JobserverConfig::None`]. Overridden words are never
/// validated: a malformed `--jobserver-fds=` value is only an error
/// when it is still the winner once every word has been seen.
pub fn parse_makeflags(flags: &str) -> Result<JobserverConfig> {
    let mut config = Ok(JobserverConfig::None);

    let mut words = flags
        .split(|c| c == ' ' || c == '\t')
        .filter(|w| !w.is_empty());

    let first = match words.next() {
        Some(w) => w,
        None => return config,
    };
    if !first.starts_with('-') && first.contains('n') {
        return config;
    }

    for word in std::iter::once(first).chain(words) {
        if let Some(rest) = word.strip_prefix("--jobserver-auth=") {
            config = Ok(parse_auth(rest));
        } else if let Some(rest) = word.strip_prefix("--jobserver-fds=") {
            config = parse_fds(rest);
        }
    }

    config
}

fn parse_auth(rest: &str) -> JobserverConfig {
    if let Some(path) = rest.strip_prefix("fifo:") {
        return JobserverConfig::Fifo(path.to_string());
    }
    match parse_fd_pair(rest) {
        // A negative descriptor is how make tells a recursive child
        // that the jobserver is disabled for it.
        Some((read, write)) if read < 0 || write < 0 => JobserverConfig::None,
        Some((read, write)) => JobserverConfig::FileDescriptors { read, write },
        None => JobserverConfig::Win32Semaphore(rest.to_string()),
    }
}

fn parse_fds(rest: &str) -> Result<JobserverConfig> {
    match parse_fd_pair(rest) {
        Some((read, write)) if read < 0 || write < 0 => Ok(JobserverConfig::None),
        Some((read, write)) => Ok(JobserverConfig::FileDescriptors { read, write }),
        None => Err(Error::BadDescriptorPair(rest.to_string())),
    }
}

fn parse_fd_pair(s: &str) -> Option<(i32, i32)> {
    let (read, write) = s.split_once(',')?;
    Some((read.parse().ok()?, write.parse().ok()?))
}
