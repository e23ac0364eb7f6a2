use std::io;

use thiserror::Error;

/// Errors produced while wiring up or driving parallelism coordination.
///
/// Configuration and factory errors are returned to the caller;
/// event-loop errors that indicate violated OS invariants surface as
/// [`Error::RuntimeIo`] and are not recoverable. Jobserver release
/// errors are deliberately *not* represented here: by protocol there is
/// no remediation, so they are swallowed at the call site.
#[derive(Debug, Error)]
pub enum Error {
    /// A `--jobserver-fds=` value that is not two comma-separated
    /// decimal integers.
    #[error("malformed descriptor pair `{0}` in --jobserver-fds")]
    BadDescriptorPair(String),

    /// The parsed jobserver mode cannot be served on this platform.
    #[error("jobserver mode `{0}` is not supported on this platform")]
    UnsupportedMode(&'static str),

    /// A pool must hold one implicit slot plus at least one token.
    #[error("a jobserver pool needs at least 2 slots, got {0}")]
    InvalidSlotCount(usize),

    /// A pipe, fifo or semaphore endpoint could not be set up.
    #[error("jobserver endpoint setup failed: {context}")]
    EndpointSetup {
        /// What was being set up when the failure happened.
        context: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Fatal child-creation failure.
    #[error("failed to start subprocess")]
    Spawn(#[source] io::Error),

    /// Unexpected OS failure inside the event loop.
    #[error("subprocess event loop failed")]
    RuntimeIo(#[source] io::Error),

    /// A second supervisor was constructed while one already owns the
    /// process-wide signal handlers.
    #[error("a subprocess supervisor already exists in this process")]
    SupervisorExists,
}

impl Error {
    pub(crate) fn endpoint(context: impl Into<String>, source: io::Error) -> Self {
        Error::EndpointSetup {
            context: context.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
