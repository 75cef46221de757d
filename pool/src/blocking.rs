use crate::error::{Error, ForkError};
use crate::fork::{self, ForkAware, ForkPolicy};
use crate::sync::{ForkMutex, ForkMutexGuard};

use log::debug;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Connection factory. Owns whatever it needs to reach its destination.
pub trait Connect: Send + Sync + 'static {
    type Conn: Send + 'static;
    type Err: StdError + Send + Sync + 'static;

    fn connect(&self) -> Result<Self::Conn, Self::Err>;
}

struct Idle<C> {
    id: u64,
    conn: C,
}

struct Slots<C> {
    idle: VecDeque<Idle<C>>,
    borrowed: usize,
}

struct Shared<K: Connect> {
    name: String,
    policy: ForkPolicy,
    max_idle: Option<usize>,
    connector: K,
    slots: ForkMutex<Slots<K::Conn>>,
    /// Set while the atfork prepare handler holds `slots`.
    held_for_fork: AtomicBool,
    generation: AtomicU64,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub idle: usize,
    pub borrowed: usize,
    pub created: u64,
    pub discarded: u64,
    pub generation: u64,
}

static NEXT_POOL: AtomicUsize = AtomicUsize::new(0);

/// Configures a [`Pool`] before it is registered for fork handling.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    policy: ForkPolicy,
    max_idle: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Name used in logs and fork errors.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn policy(mut self, policy: ForkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Close connections released into an idle sequence that already holds
    /// `max` of them.
    pub fn max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    pub fn build<K: Connect>(self, connector: K) -> Pool<K> {
        let name = self
            .name
            .unwrap_or_else(|| format!("pool-{}", NEXT_POOL.fetch_add(1, Ordering::Relaxed)));
        let shared = Arc::new(Shared {
            name,
            policy: self.policy,
            max_idle: self.max_idle,
            connector,
            slots: ForkMutex::new(Slots {
                idle: VecDeque::new(),
                borrowed: 0,
            }),
            held_for_fork: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });
        let weak: Weak<Shared<K>> = Arc::downgrade(&shared);
        fork::register(weak);
        debug!("{}: created with {:?} fork policy", shared.name, shared.policy);
        Pool { shared }
    }
}

/// A pool of reusable connections handed out to one borrower at a time.
pub struct Pool<K: Connect> {
    shared: Arc<Shared<K>>,
}

impl<K: Connect> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Connect> fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

impl<K: Connect> Pool<K> {
    pub fn new(connector: K) -> Self {
        Builder::new().build(connector)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> ForkPolicy {
        self.shared.policy
    }

    /// Hand out the oldest idle connection, or a new one from the factory.
    ///
    /// The factory runs without the pool lock held. Its error is returned as
    /// is, without retrying.
    pub fn acquire(&self) -> Result<Lease<K>, Error<K::Err>> {
        let (reused, generation) = {
            let mut slots = self.shared.slots.lock();
            slots.borrowed += 1;
            (
                slots.idle.pop_front(),
                self.shared.generation.load(Ordering::Acquire),
            )
        };

        let (id, conn) = match reused {
            Some(Idle { id, conn }) => {
                debug!("{}: reusing connection #{}", self.shared.name, id);
                (id, conn)
            }
            None => match self.shared.connector.connect() {
                Ok(conn) => {
                    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                    self.shared.created.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: opened connection #{}", self.shared.name, id);
                    (id, conn)
                }
                Err(e) => {
                    self.shared.give_back_slot(generation);
                    debug!("{}: connect failed: {}", self.shared.name, e);
                    return Err(Error::Connect(e));
                }
            },
        };

        Ok(Lease {
            conn: Some(conn),
            id,
            generation,
            broken: false,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Return a connection to the idle sequence.
    ///
    /// Broken and pre-fork leases are discarded instead. A lease from another
    /// pool is sent back to that pool and reported as [`Error::ForeignLease`].
    pub fn release(&self, lease: Lease<K>) -> Result<(), Error<K::Err>> {
        if !Arc::ptr_eq(&self.shared, &lease.shared) {
            return Err(Error::ForeignLease);
        }
        lease.release();
        Ok(())
    }

    /// Close a connection without returning it to the idle sequence.
    pub fn discard(&self, lease: Lease<K>) -> Result<(), Error<K::Err>> {
        if !Arc::ptr_eq(&self.shared, &lease.shared) {
            return Err(Error::ForeignLease);
        }
        lease.discard();
        Ok(())
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        let idle = mem::take(&mut self.shared.slots.lock().idle);
        self.shared
            .discarded
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        debug!("{}: closed {} idle connection(s)", self.shared.name, idle.len());
    }

    pub fn state(&self) -> State {
        let slots = self.shared.slots.lock();
        State {
            idle: slots.idle.len(),
            borrowed: slots.borrowed,
            created: self.shared.created.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            generation: self.shared.generation.load(Ordering::Acquire),
        }
    }

    /// Whether some thread currently holds the pool lock.
    pub fn is_locked(&self) -> bool {
        self.shared.slots.is_locked()
    }

    /// Hold the pool lock to inspect the idle sequence.
    ///
    /// Every acquire and release on this pool blocks until the guard is
    /// dropped, including ones made by the thread holding it.
    pub fn lock_idle(&self) -> IdleGuard<'_, K::Conn> {
        IdleGuard {
            slots: self.shared.slots.lock(),
        }
    }
}

/// The pool lock, held. Read-only view of the idle sequence.
pub struct IdleGuard<'a, C> {
    slots: ForkMutexGuard<'a, Slots<C>>,
}

impl<C> IdleGuard<'_, C> {
    pub fn len(&self) -> usize {
        self.slots.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.idle.is_empty()
    }

    /// Ids of idle connections, next to be handed out first.
    pub fn ids(&self) -> Vec<u64> {
        self.slots.idle.iter().map(|i| i.id).collect()
    }

    pub fn borrowed(&self) -> usize {
        self.slots.borrowed
    }
}

impl<K: Connect> Shared<K> {
    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation.load(Ordering::Acquire)
    }

    fn give_back_slot(&self, generation: u64) {
        if self.is_current(generation) {
            let mut slots = self.slots.lock();
            slots.borrowed = slots.borrowed.saturating_sub(1);
        }
    }

    fn check_in(&self, id: u64, conn: K::Conn, generation: u64) {
        if !self.is_current(generation) {
            // the parent still owns this connection, only our descriptor goes
            debug!("{}: closing connection #{} inherited across fork", self.name, id);
            return;
        }
        let overflow = {
            let mut slots = self.slots.lock();
            slots.borrowed = slots.borrowed.saturating_sub(1);
            match self.max_idle {
                Some(max) if slots.idle.len() >= max => Some(conn),
                _ => {
                    slots.idle.push_back(Idle { id, conn });
                    None
                }
            }
        };
        if let Some(conn) = overflow {
            self.destroyed(id, conn, "idle sequence full");
        }
    }

    fn check_out_for_good(&self, id: u64, conn: K::Conn, generation: u64) {
        if !self.is_current(generation) {
            debug!("{}: closing connection #{} inherited across fork", self.name, id);
            return;
        }
        self.give_back_slot(generation);
        self.destroyed(id, conn, "discarded");
    }

    fn destroyed(&self, id: u64, conn: K::Conn, why: &str) {
        drop(conn);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("{}: closed connection #{} ({})", self.name, id, why);
    }
}

impl<K: Connect> ForkAware for Shared<K> {
    fn policy(&self) -> ForkPolicy {
        self.policy
    }

    fn freeze(&self) -> Result<(), ForkError> {
        let raw = self.slots.raw();
        if !raw.try_lock() {
            return Err(ForkError::LockHeld {
                pool: self.name.clone(),
            });
        }
        let borrowed = unsafe { (*self.slots.data_ptr()).borrowed };
        if borrowed > 0 {
            unsafe { raw.unlock() };
            return Err(ForkError::Borrowed {
                pool: self.name.clone(),
                count: borrowed,
            });
        }
        Ok(())
    }

    unsafe fn thaw(&self) {
        self.slots.raw().unlock();
    }

    unsafe fn drop_inherited(&self) {
        let slots = &mut *self.slots.data_ptr();
        slots.borrowed = 0;
        let inherited = mem::take(&mut slots.idle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(inherited);
    }

    fn hold_for_fork(&self) {
        if self.slots.raw().try_lock() {
            self.held_for_fork.store(true, Ordering::Relaxed);
        }
    }

    unsafe fn parent_after_fork(&self) {
        if self.held_for_fork.swap(false, Ordering::Relaxed) {
            self.slots.raw().unlock();
        }
    }

    unsafe fn child_after_fork(&self) {
        let consistent = self.held_for_fork.swap(false, Ordering::Relaxed);
        match self.policy {
            ForkPolicy::Reset => {
                if !consistent {
                    // whoever held the lock may have been halfway through
                    // growing the idle sequence, so none of it is trusted
                    ptr::write(&mut (*self.slots.data_ptr()).idle, VecDeque::new());
                }
                self.drop_inherited();
                self.slots.raw().reset();
            }
            // a lock held by another thread stays held here
            ForkPolicy::Forbid if consistent => {
                self.drop_inherited();
                self.slots.raw().reset();
            }
            ForkPolicy::Forbid => {}
        }
    }
}

/// Exclusive use of one pooled connection. Dropping it releases the
/// connection back to its pool.
pub struct Lease<K: Connect> {
    conn: Option<K::Conn>,
    id: u64,
    generation: u64,
    broken: bool,
    shared: Arc<Shared<K>>,
}

impl<K: Connect> Lease<K> {
    /// Pool-unique id of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Issued before this process was forked from the lease owner.
    pub fn is_stale(&self) -> bool {
        !self.shared.is_current(self.generation)
    }

    /// Have the connection discarded instead of released.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Run an I/O operation on the connection.
    ///
    /// An I/O error marks the lease broken and later calls fail fast with
    /// [`Error::Discarded`] without touching the connection.
    pub fn try_use<T, F>(&mut self, f: F) -> Result<T, Error<K::Err>>
    where
        F: FnOnce(&mut K::Conn) -> io::Result<T>,
    {
        if self.is_stale() {
            return Err(Error::Stale);
        }
        if self.broken {
            return Err(Error::Discarded);
        }
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::Discarded),
        };
        f(conn).map_err(|e| {
            self.broken = true;
            debug!("{}: connection #{} broke: {}", self.shared.name, self.id, e);
            Error::Broken(e)
        })
    }

    pub fn release(self) {
        drop(self)
    }

    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.check_out_for_good(self.id, conn, self.generation);
        }
    }
}

impl<K: Connect> fmt::Debug for Lease<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.shared.name)
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl<K: Connect> Deref for Lease<K> {
    type Target = K::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl<K: Connect> DerefMut for Lease<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl<K: Connect> Drop for Lease<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                self.shared.check_out_for_good(self.id, conn, self.generation);
            } else {
                self.shared.check_in(self.id, conn, self.generation);
            }
        }
    }
}
