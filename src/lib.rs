//! Build-parallelism coordination for build executors.
//!
//! This crate is the concurrency core of a build executor that
//! interoperates with the GNU `make` jobserver protocol. It covers two
//! tightly coupled responsibilities:
//!
//! - a **jobserver endpoint**: a non-blocking [`Client`] that acquires
//!   and releases slots from an externally owned pool, and a [`Pool`]
//!   that creates a fresh pool and advertises it through the
//!   tool-invocation environment ([`parse_makeflags`] reads the same
//!   variable back);
//! - a **subprocess supervisor**: a [`SubprocessSet`] event loop that
//!   starts children, multiplexes their stdout/stderr asynchronously,
//!   reaps them, and propagates interruption signals.
//!
//! Around the core sit two small supporting pieces: [`CanonicalPath`],
//! the normalized path value builds use as a stable target identity,
//! and [`StatusTable`], which periodically renders the oldest running
//! commands on a smart terminal.
//!
//! The jobserver protocol is described in [detail online][docs]; it
//! boils down to a cross-process semaphore carried by a pipe or fifo
//! on unix and a named semaphore on windows, plus one *implicit* slot
//! every participant owns outright so that `-j1` builds still make
//! progress.
//!
//! ## Examples
//!
//! Attach to the jobserver advertised by a parent `make` and run one
//! command under its admission control:
//!
//! ```no_run
//! use jobcrew::{parse_makeflags, Client, SubprocessSet};
//!
//! fn main() -> Result<(), jobcrew::Error> {
//!     let flags = std::env::var("MAKEFLAGS").unwrap_or_default();
//!     let config = parse_makeflags(&flags)?;
//!     let mut client = match unsafe { Client::from_config(&config)? } {
//!         Some(client) => client,
//!         None => return Ok(()), // no jobserver in the environment
//!     };
//!
//!     let slot = client.try_acquire();
//!     if !slot.is_valid() {
//!         return Ok(()); // pool exhausted; try again after do_work()
//!     }
//!
//!     let mut subprocs = SubprocessSet::new()?;
//!     let id = subprocs.add("cc -c foo.c -o foo.o", false)?;
//!     let mut finished = None;
//!     while finished.is_none() {
//!         if subprocs.do_work()? {
//!             subprocs.clear(); // interrupted
//!             return Ok(());
//!         }
//!         finished = subprocs.next_finished();
//!     }
//!
//!     let mut sub = finished.unwrap();
//!     assert_eq!(sub.id(), id);
//!     let status = sub.finish()?;
//!     client.release(slot);
//!     println!("{:?}, {} output bytes", status, sub.combined_output().len());
//!     Ok(())
//! }
//! ```
//!
//! Create a fresh pool and export it so child tools can attach:
//!
//! ```no_run
//! use jobcrew::Pool;
//!
//! # fn main() -> Result<(), jobcrew::Error> {
//! let pool = Pool::new(4)?;
//! let mut flags = std::env::var("MAKEFLAGS").unwrap_or_default();
//! flags.push_str(pool.env_fragment());
//! std::env::set_var("MAKEFLAGS", flags);
//! // ...spawn children; they inherit the pool...
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: one thread drives everything by
//! calling [`SubprocessSet::do_work`], which contains the only
//! blocking call in the crate. Everything else, the jobserver client
//! included, is non-blocking by contract: a scheduler is expected to
//! `try_acquire`, and when that fails, wait in `do_work` until a
//! running command finishes and frees a slot.
//!
//! Signal-handler state is process-wide, so at most one
//! [`SubprocessSet`] may exist at a time; a second construction
//! returns [`Error::SupervisorExists`].
//!
//! ## Caveats
//!
//! No attempt is made to return tokens to the pool on abnormal exit.
//! If this process is killed while holding explicit slots, the
//! jobserver loses capacity; that is normally fine because ctrl-c
//! tears the whole build down, but it is worth knowing.
//!
//! [docs]: http://make.mad-scientist.net/papers/jobserver-implementation/

#![deny(missing_docs, missing_debug_implementations)]
// only enables the nightly `doc_auto_cfg` feature when
// the `docsrs` configuration attribute is defined
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod canon;
mod error;
mod flags;
#[cfg(any(unix, windows))]
mod jobserver;
mod status;
#[cfg(any(unix, windows))]
mod subprocess;

pub use canon::CanonicalPath;
pub use error::{Error, Result};
pub use flags::{parse_makeflags, JobserverConfig};
#[cfg(any(unix, windows))]
pub use jobserver::{Client, Pool, Slot};
pub use status::{AnsiTablePrinter, StatusTable, TablePrinter};
#[cfg(any(unix, windows))]
pub use subprocess::{ExitStatus, Subprocess, SubprocessSet};
