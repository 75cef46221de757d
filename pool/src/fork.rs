//! Process duplication discipline for pools.
//!
//! A forked child is a copy of the parent's memory taken at an arbitrary
//! instant, but only the forking thread runs in it. Any lock held by another
//! thread at that instant stays held forever in the child. Pools therefore
//! declare a [`ForkPolicy`]:
//!
//! * [`ForkPolicy::Forbid`]: the process must not fork while the pool lock is
//!   held or while connections are checked out. [`fork`] checks this and
//!   refuses instead of producing a child that hangs. A raw `fork()` is the
//!   application's responsibility: if the lock was free, the child closes
//!   its copies of the idle connections, otherwise the lock stays held.
//! * [`ForkPolicy::Reset`]: the child re-initializes the pool lock and drops
//!   the idle sequence right after any fork, checked or raw, through a
//!   `pthread_atfork` child handler. An idle sequence whose lock another
//!   thread held at the fork is forgotten rather than dropped.
//!
//! In both cases the parent keeps its connections and the child closes its
//! copies of them.

use crate::error::ForkError;
use crate::sync::ForkMutex;

use log::{info, warn};
use nix::unistd::ForkResult;
use once_cell::sync::Lazy;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// What a pool does when the process forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    /// No fork while the lock is held or a connection is borrowed.
    Forbid,
    /// Fresh lock and empty idle sequence in every child.
    Reset,
}

impl Default for ForkPolicy {
    fn default() -> Self {
        ForkPolicy::Forbid
    }
}

impl std::str::FromStr for ForkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forbid" => Ok(ForkPolicy::Forbid),
            "reset" => Ok(ForkPolicy::Reset),
            other => Err(format!("unknown fork policy `{}` (expected forbid or reset)", other)),
        }
    }
}

/// The view of a pool the fork machinery needs, independent of its
/// connection type.
pub(crate) trait ForkAware: Send + Sync {
    fn policy(&self) -> ForkPolicy;

    /// Take the pool lock and verify nothing is borrowed. On success the lock
    /// stays held until [`ForkAware::thaw`].
    fn freeze(&self) -> Result<(), ForkError>;

    /// # Safety
    /// Must follow a successful `freeze` on this thread (or its forked copy).
    unsafe fn thaw(&self);

    /// Close the child's copies of the idle connections and retire every
    /// lease issued before the fork.
    ///
    /// # Safety
    /// Only in a forked child, with the pool lock held by the forking thread.
    unsafe fn drop_inherited(&self);

    /// Take the pool lock for the duration of a fork if it is free, so the
    /// child inherits an idle sequence nobody was changing.
    fn hold_for_fork(&self);

    /// # Safety
    /// Only in the parent, after `hold_for_fork` on this thread.
    unsafe fn parent_after_fork(&self);

    /// Close or forget pre-fork state according to the policy.
    ///
    /// # Safety
    /// Only in a freshly forked child, before it spawns threads.
    unsafe fn child_after_fork(&self);
}

static POOLS: ForkMutex<Vec<Weak<dyn ForkAware>>> = ForkMutex::new(Vec::new());

static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

static LOCK_USERS: AtomicUsize = AtomicUsize::new(0);

static ATFORK_HANDLERS: Lazy<bool> = Lazy::new(|| {
    let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if rc != 0 {
        warn!("pthread_atfork failed ({}), reset pools are unprotected", rc);
    }
    rc == 0
});

// The registry lock and every free pool lock are held across every fork, so
// the child never sees a pool or the registry in the middle of a change. A
// pool lock that is already held is skipped: its holder may be the forking
// thread itself.
unsafe extern "C" fn prepare() {
    POOLS.raw().lock();
    for pool in (*POOLS.data_ptr()).iter().filter_map(Weak::upgrade) {
        pool.hold_for_fork();
    }
}

unsafe extern "C" fn parent() {
    for pool in (*POOLS.data_ptr()).iter().filter_map(Weak::upgrade) {
        pool.parent_after_fork();
    }
    POOLS.raw().unlock();
}

/// Runs in the child with only the forking thread alive.
unsafe extern "C" fn child() {
    FORK_GENERATION.fetch_add(1, Ordering::Release);
    // background threads were not duplicated
    LOCK_USERS.store(0, Ordering::Release);

    for pool in (*POOLS.data_ptr()).iter().filter_map(Weak::upgrade) {
        pool.child_after_fork();
    }
    POOLS.raw().reset();
}

pub(crate) fn register(pool: Weak<dyn ForkAware>) {
    Lazy::force(&ATFORK_HANDLERS);

    let mut pools = POOLS.lock();
    pools.retain(|p| p.strong_count() > 0);
    pools.push(pool);
}

fn live_pools() -> Vec<Arc<dyn ForkAware>> {
    POOLS.lock().iter().filter_map(Weak::upgrade).collect()
}

/// Number of forks between the process that first created a pool and this
/// process image.
pub fn fork_generation() -> u64 {
    FORK_GENERATION.load(Ordering::Acquire)
}

/// Background threads currently registered as lock users (see
/// [`crate::quiesce::Quiescer`]).
pub fn background_lock_users() -> usize {
    LOCK_USERS.load(Ordering::Acquire)
}

pub(crate) fn lock_user_started() {
    LOCK_USERS.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn lock_user_finished(generation: u64) {
    // a thread spawned before a fork only exists in the parent, whose
    // counter it was added to
    if generation == fork_generation() {
        LOCK_USERS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fork the process, unless a [`ForkPolicy::Forbid`] pool makes it unsafe.
///
/// Refuses when a forbid pool's lock is held, when one of its connections is
/// checked out, or when background lock users are still running. Every forbid
/// pool lock is held across the fork itself, so no thread can take one
/// between the check and the duplication. In the child, forbid pools drop
/// their idle connections and reset pools start over.
///
/// # Safety
/// Same contract as [`nix::unistd::fork`]: in a multi-threaded parent the child
/// may only rely on state that was not owned by other threads.
pub unsafe fn fork() -> Result<ForkResult, ForkError> {
    let forbid: Vec<_> = live_pools()
        .into_iter()
        .filter(|p| p.policy() == ForkPolicy::Forbid)
        .collect();

    if !forbid.is_empty() {
        let users = background_lock_users();
        if users > 0 {
            warn!("refusing to fork: {} background lock user(s) running", users);
            return Err(ForkError::BackgroundThreads(users));
        }
    }

    let mut frozen: Vec<&Arc<dyn ForkAware>> = Vec::with_capacity(forbid.len());
    for pool in &forbid {
        if let Err(e) = pool.freeze() {
            for p in &frozen {
                p.thaw();
            }
            warn!("refusing to fork: {}", e);
            return Err(e);
        }
        frozen.push(pool);
    }

    let result = nix::unistd::fork();
    match result {
        Ok(ForkResult::Child) => {
            for p in &frozen {
                p.drop_inherited();
                p.thaw();
            }
        }
        Ok(ForkResult::Parent { child }) => {
            for p in &frozen {
                p.thaw();
            }
            info!("forked child {} ({} forbid pool(s) checked)", child, frozen.len());
        }
        Err(_) => {
            for p in &frozen {
                p.thaw();
            }
        }
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_str() {
        assert_eq!("forbid".parse::<ForkPolicy>(), Ok(ForkPolicy::Forbid));
        assert_eq!("reset".parse::<ForkPolicy>(), Ok(ForkPolicy::Reset));
        assert!("sometimes".parse::<ForkPolicy>().is_err());
    }

    #[test]
    fn default_policy_forbids() {
        assert_eq!(ForkPolicy::default(), ForkPolicy::Forbid);
    }
}
