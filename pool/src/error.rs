use std::io;
use thiserror::Error;

/// Errors surfaced by a pool or one of its leases.
///
/// `E` is the error type of the pool's connection factory.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The factory failed to establish a connection. Not retried.
    #[error("failed to establish connection: {0}")]
    Connect(#[source] E),

    /// A borrowed connection failed during use. Discard the lease and retry
    /// with a fresh one.
    #[error("connection broke during use: {0}")]
    Broken(#[source] io::Error),

    /// The lease was already found broken; its connection is not used again.
    #[error("connection was discarded")]
    Discarded,

    /// The lease was issued before this process was forked and belongs to
    /// the parent.
    #[error("connection was inherited across fork and belongs to the parent process")]
    Stale,

    /// The lease was obtained from a different pool.
    #[error("lease does not belong to this pool")]
    ForeignLease,
}

impl<E> Error<E> {
    /// Whether retrying with a freshly acquired connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Broken(_) | Error::Discarded | Error::Stale)
    }
}

/// Reasons a checked fork was refused or failed.
#[derive(Debug, Error)]
pub enum ForkError {
    #[error("pool `{pool}` lock is held")]
    LockHeld { pool: String },

    #[error("pool `{pool}` has {count} connection(s) checked out")]
    Borrowed { pool: String, count: usize },

    #[error("{0} background lock user(s) still running, quiesce them first")]
    BackgroundThreads(usize),

    #[error("fork failed: {0}")]
    Fork(#[from] nix::Error),
}
