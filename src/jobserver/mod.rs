//! Jobserver endpoint: token client and token pool.
//!
//! Both halves of the GNU make jobserver protocol live here. The
//! [`Client`] attaches to an externally owned pool and hands out
//! [`Slot`]s without ever blocking; the [`Pool`] creates a fresh pool
//! and advertises it through a `MAKEFLAGS` fragment so child tools can
//! attach their own clients.

use std::env;
use std::io;

use cfg_if::cfg_if;

use crate::error::{Error, Result};
use crate::flags::{parse_makeflags, JobserverConfig};

cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod imp;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod imp;
    }
}

/// A parallelism slot held by the build.
///
/// Slots are move-only resources: releasing one consumes it, so a
/// double release is a type error rather than a protocol violation.
/// Dropping an `Explicit` slot without releasing it leaks a token from
/// the shared pool.
#[derive(Debug, PartialEq, Eq)]
pub enum Slot {
    /// No slot could be acquired.
    Invalid,
    /// The one slot every jobserver participant may use without
    /// consulting the pool; preserves forward progress at `-j1`.
    Implicit,
    /// A token byte read from the pool. The byte is opaque and must be
    /// written back verbatim on release.
    Explicit(u8),
}

impl Slot {
    /// Whether this slot admits running a command.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Slot::Invalid)
    }
}

/// Non-blocking client of an externally owned jobserver pool.
#[derive(Debug)]
pub struct Client {
    imp: imp::Client,
    has_implicit: bool,
}

impl Client {
    /// Builds a client for the pool described by `config`.
    ///
    /// Returns `Ok(None)` when no jobserver is configured. Fails with
    /// [`Error::UnsupportedMode`] when the platform cannot serve the
    /// mode, and [`Error::EndpointSetup`] when the endpoints do not
    /// check out.
    ///
    /// # Safety
    ///
    /// In descriptor-pair mode this adopts raw integers from the
    /// environment as file descriptors. The caller must ensure they
    /// are not concurrently owned by anything else in this process;
    /// calling early in the program's life is the usual way.
    pub unsafe fn from_config(config: &JobserverConfig) -> Result<Option<Client>> {
        let config = config.clone().into_native()?;
        let imp = match config {
            JobserverConfig::None => return Ok(None),
            #[cfg(unix)]
            JobserverConfig::FileDescriptors { read, write } => imp::Client::from_fds(read, write)?,
            #[cfg(unix)]
            JobserverConfig::Fifo(path) => imp::Client::from_fifo(path.as_ref())?,
            #[cfg(windows)]
            JobserverConfig::Win32Semaphore(name) => imp::Client::open(&name)?,
            _ => unreachable!("into_native rejected the non-native modes"),
        };
        Ok(Some(Client {
            imp,
            has_implicit: true,
        }))
    }

    /// Attempts to connect to the jobserver advertised in this
    /// process's environment (`MAKEFLAGS`, then `MFLAGS`).
    ///
    /// # Safety
    ///
    /// Same as [`Client::from_config`].
    pub unsafe fn from_env() -> Option<Client> {
        let var = env::var("MAKEFLAGS").or_else(|_| env::var("MFLAGS")).ok()?;
        let config = parse_makeflags(&var).ok()?;
        Client::from_config(&config).ok().flatten()
    }

    /// Acquires a slot without blocking.
    ///
    /// The implicit slot is handed out first and costs no I/O. After
    /// that, one non-blocking read against the pool either yields an
    /// [`Slot::Explicit`] token or [`Slot::Invalid`]; the caller is
    /// expected to retry after some running command finishes.
    pub fn try_acquire(&mut self) -> Slot {
        if self.has_implicit {
            self.has_implicit = false;
            return Slot::Implicit;
        }
        match self.imp.try_acquire() {
            Some(byte) => Slot::Explicit(byte),
            None => Slot::Invalid,
        }
    }

    /// Returns a slot.
    ///
    /// `Invalid` is a no-op, `Implicit` is reclaimed locally, and an
    /// `Explicit` token byte is written back to the pool. Write
    /// failures are absorbed: the protocol has no recovery for them.
    pub fn release(&mut self, slot: Slot) {
        match slot {
            Slot::Invalid => {}
            Slot::Implicit => {
                debug_assert!(!self.has_implicit, "implicit slot released twice");
                self.has_implicit = true;
            }
            Slot::Explicit(byte) => self.imp.release(byte),
        }
    }

    /// Number of tokens currently buffered in the pool.
    pub fn available(&self) -> io::Result<usize> {
        self.imp.available()
    }
}

/// A freshly created jobserver pool, exported via the environment.
#[derive(Debug)]
pub struct Pool {
    imp: imp::Pool,
}

impl Pool {
    /// Creates a pool of `slots` total slots: one implicit slot for
    /// the owner plus `slots - 1` tokens for everyone else.
    ///
    /// Uses an anonymous pipe on unix and a named semaphore on
    /// windows. Fails with [`Error::InvalidSlotCount`] for
    /// `slots < 2`.
    pub fn new(slots: usize) -> Result<Pool> {
        Pool::check_slots(slots)?;
        #[cfg(unix)]
        let imp = imp::Pool::new_pipe(slots)?;
        #[cfg(windows)]
        let imp = imp::Pool::new_semaphore(slots)?;
        Ok(Pool { imp })
    }

    /// Same as [`Pool::new`] but backed by a named fifo under
    /// `$TMPDIR` (falling back to `/tmp`), the form newer make
    /// releases prefer. The fifo node is removed when the pool is
    /// dropped.
    #[cfg(unix)]
    pub fn new_with_fifo(slots: usize) -> Result<Pool> {
        Pool::check_slots(slots)?;
        Ok(Pool {
            imp: imp::Pool::new_fifo(slots)?,
        })
    }

    fn check_slots(slots: usize) -> Result<()> {
        if slots < 2 {
            return Err(Error::InvalidSlotCount(slots));
        }
        Ok(())
    }

    /// The fragment to splice into the tool-invocation flags variable.
    ///
    /// The leading space is part of the fragment. Pipe pools emit both
    /// `--jobserver-fds=` and `--jobserver-auth=` so that tooling from
    /// before the rename still connects.
    pub fn env_fragment(&self) -> &str {
        self.imp.env_fragment()
    }

    /// Total slot count, as advertised by `-j`.
    pub fn slots(&self) -> usize {
        self.imp.slots()
    }

    /// Number of tokens currently buffered and unclaimed.
    pub fn available(&self) -> io::Result<usize> {
        self.imp.available()
    }
}
