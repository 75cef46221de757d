//! A connection pool that stays correct across `fork()`.
//!
//! [`blocking::Pool`] hands each connection to one borrower at a time and
//! reuses idle connections before opening new ones. Every pool declares a
//! [`fork::ForkPolicy`] saying what happens to it when the process forks;
//! [`fork::fork`] refuses to duplicate the process while that would leave a
//! child with a lock nobody can release.

/// blocking pool guarded by a fork-resettable lock
pub mod blocking;
pub mod error;
/// fork registry, atfork handlers and the checked fork
pub mod fork;
pub mod quiesce;
pub mod sync;
pub mod tcp;

pub use blocking::{Builder, Connect, Lease, Pool, State};
pub use error::{Error, ForkError};
pub use fork::ForkPolicy;
