//! Background threads that touch pool locks, and how to stop them before a
//! fork.

use crate::fork;

use crossbeam_channel as mpmc;
use log::{debug, warn};

use std::io;
use std::mem;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handed to every background thread; tells it when to stop.
pub struct StopSignal {
    rx: mpmc::Receiver<()>,
}

impl StopSignal {
    /// Sleep for up to `timeout`. Returns `true` as soon as a stop is
    /// requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.rx.recv_timeout(timeout),
            Err(mpmc::RecvTimeoutError::Timeout)
        )
    }

    pub fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(mpmc::TryRecvError::Empty))
    }
}

struct Finished(u64);

impl Drop for Finished {
    fn drop(&mut self) {
        fork::lock_user_finished(self.0);
    }
}

/// Owns background lock users so they can be signalled and joined before the
/// process forks. While any of them runs, [`fork::fork`] refuses to fork if a
/// [`fork::ForkPolicy::Forbid`] pool exists.
pub struct Quiescer {
    stop_tx: mpmc::Sender<()>,
    stop_rx: mpmc::Receiver<()>,
    handles: Vec<JoinHandle<()>>,
    generation: u64,
}

impl Quiescer {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = mpmc::bounded(0);
        Quiescer {
            stop_tx,
            stop_rx,
            handles: Vec::new(),
            generation: fork::fork_generation(),
        }
    }

    /// Start a named background thread. It should return promptly once its
    /// [`StopSignal`] fires.
    pub fn spawn<F>(&mut self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let signal = StopSignal {
            rx: self.stop_rx.clone(),
        };
        let generation = fork::fork_generation();
        fork::lock_user_started();
        let spawned = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _finished = Finished(generation);
            f(signal);
        });
        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                fork::lock_user_finished(generation);
                Err(e)
            }
        }
    }

    /// Threads started and not yet finished.
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every thread to stop and join it. Returns how many were joined.
    ///
    /// In a forked child the threads do not exist; their handles are
    /// forgotten instead.
    pub fn quiesce(&mut self) -> usize {
        let (stop_tx, stop_rx) = mpmc::bounded(0);
        drop(mem::replace(&mut self.stop_tx, stop_tx));
        self.stop_rx = stop_rx;

        let handles = mem::take(&mut self.handles);
        if self.generation != fork::fork_generation() {
            debug!("forgetting {} background thread(s) left in the parent", handles.len());
            self.generation = fork::fork_generation();
            mem::forget(handles);
            return 0;
        }

        let mut joined = 0;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
            match handle.join() {
                Ok(()) => joined += 1,
                Err(_) => warn!("background thread {} panicked", name),
            }
        }
        debug!("quiesced {} background thread(s)", joined);
        joined
    }
}

impl Default for Quiescer {
    fn default() -> Self {
        Quiescer::new()
    }
}

impl Drop for Quiescer {
    fn drop(&mut self) {
        self.quiesce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn quiesce_stops_and_joins_looping_threads() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut q = Quiescer::new();
        for i in 0..3 {
            let ticks = Arc::clone(&ticks);
            q.spawn(&format!("ticker-{}", i), move |stop| {
                while !stop.wait(Duration::from_millis(5)) {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
        }
        assert!(fork::background_lock_users() >= 3);
        assert_eq!(q.quiesce(), 3);
        assert_eq!(q.active(), 0);

        let after = ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }

    #[test]
    fn quiescer_is_reusable_after_quiesce() {
        let mut q = Quiescer::new();
        q.spawn("first", |stop| while !stop.wait(Duration::from_millis(5)) {})
            .unwrap();
        assert_eq!(q.quiesce(), 1);

        let (started_tx, started_rx) = mpmc::bounded(1);
        q.spawn("second", move |stop| {
            let _ = started_tx.send(stop.is_stopped());
            while !stop.wait(Duration::from_millis(5)) {}
        })
        .unwrap();
        // a fresh stop channel, not the one the first quiesce closed
        assert!(!started_rx.recv().unwrap());
        assert_eq!(q.quiesce(), 1);
    }
}
