//! The fork experiments. Each one is a straight line of steps printing what
//! every process observes; children print and exit, parents wait for them.

use crate::client;
use crate::workers::WorkerPool;

use pool::fork::{self, ForkPolicy};
use pool::quiesce::Quiescer;
use pool::tcp::{Destination, TcpConnector};
use pool::{Builder, Connect, Pool};

use anyhow::{Context, Result};
use log::info;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpid, ForkResult, Pid};
use rand::Rng;

use std::convert::Infallible;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::FromRawFd;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Connections that are just numbers; the experiments only care about the
/// pool lock.
#[derive(Debug, Default)]
pub struct Tokens(AtomicU64);

impl Connect for Tokens {
    type Conn = u64;
    type Err = Infallible;

    fn connect(&self) -> Result<u64, Infallible> {
        Ok(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

fn lock_pool(name: &str, policy: ForkPolicy) -> Pool<Tokens> {
    Builder::new()
        .name(name)
        .policy(policy)
        .build(Tokens::default())
}

fn got_lock(pool: &Pool<Tokens>) {
    let _guard = pool.lock_idle();
    println!("got lock {}", getpid());
}

fn exit_child(code: i32) -> ! {
    let _ = io::stdout().flush();
    process::exit(code)
}

fn wait_for(child: Pid) -> Result<i32> {
    match waitpid(child, None).context("waitpid failed")? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
        other => anyhow::bail!("unexpected child status {:?}", other),
    }
}

fn report_child(child: Pid) -> Result<()> {
    let code = wait_for(child)?;
    println!("child {} exited with {}", child, code);
    if code != 0 {
        anyhow::bail!("child {} failed", child);
    }
    Ok(())
}

/// Take the lock briefly, fork, then take it in both processes.
///
/// With `raw`, another thread holds the lock while the process forks without
/// any check: the child's copy of the lock stays held by a thread that does
/// not exist there.
pub fn locked_fork(policy: ForkPolicy, raw: bool) -> Result<()> {
    let pool = lock_pool("locked-fork", policy);
    {
        let _guard = pool.lock_idle();
        thread::sleep(Duration::from_millis(100));
    }

    if !raw {
        println!("About to fork, locked={}", pool.is_locked());
        let forked = unsafe { fork::fork() }.context("fork refused")?;
        got_lock(&pool);
        return match forked {
            ForkResult::Child => exit_child(0),
            ForkResult::Parent { child } => report_child(child),
        };
    }

    let mut quiescer = Quiescer::new();
    let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
    {
        let pool = pool.clone();
        quiescer.spawn("lock-holder", move |stop| {
            let _guard = pool.lock_idle();
            let _ = locked_tx.send(());
            stop.wait(Duration::from_secs(60));
        })?;
    }
    locked_rx.recv().context("lock holder did not start")?;
    println!("About to fork, locked={}", pool.is_locked());

    match unsafe { nix::unistd::fork() }.context("fork failed")? {
        ForkResult::Child => {
            if pool.is_locked() {
                println!(
                    "child {}: inherited a held lock whose owner is gone, acquiring it would never return",
                    getpid()
                );
                exit_child(1)
            }
            got_lock(&pool);
            exit_child(0)
        }
        ForkResult::Parent { child } => {
            let code = wait_for(child)?;
            quiescer.quiesce();
            got_lock(&pool);
            println!("child {} exited with {}", child, code);
            Ok(())
        }
    }
}

/// A background thread holds the lock 100 ms out of every second; fork at a
/// random moment.
pub fn racing_fork(policy: ForkPolicy, quiesce: bool, max_delay: Duration) -> Result<()> {
    let pool = lock_pool("racing-fork", policy);
    let mut quiescer = Quiescer::new();
    {
        let pool = pool.clone();
        quiescer.spawn("lock-user", move |stop| loop {
            let stopped = {
                let _guard = pool.lock_idle();
                stop.wait(Duration::from_millis(100))
            };
            if stopped || stop.wait(Duration::from_millis(900)) {
                break;
            }
        })?;
    }

    let max_ms = max_delay.as_millis() as u64;
    let delay = rand::thread_rng().gen_range(0..=max_ms);
    thread::sleep(Duration::from_millis(delay));
    if quiesce {
        println!("quiesced {} background thread(s)", quiescer.quiesce());
    }

    println!("About to fork, locked={}", pool.is_locked());
    match unsafe { fork::fork() }.context("fork refused")? {
        ForkResult::Child => {
            got_lock(&pool);
            exit_child(0)
        }
        ForkResult::Parent { child } => {
            got_lock(&pool);
            report_child(child)
        }
    }
}

/// Hash a few messages in-process, then spread more over worker processes.
pub fn socket_pool(dest: Destination, calls: usize, workers: usize, jobs: usize) -> Result<()> {
    let pool = Builder::new()
        .name("hash-client")
        .policy(ForkPolicy::Reset)
        .build(TcpConnector::new(dest.clone()));

    // sequential calls reuse the same connection
    for i in 0..calls {
        let hashed = client::hash_value(&pool, format!("call {}", i).as_bytes())?;
        println!(
            "Fetching with connection #{}: {}",
            hashed.connection,
            hex::encode(hashed.digest)
        );
    }
    let state = pool.state();
    info!("{} call(s) over {} connection(s)", calls, state.created);

    if jobs == 0 {
        return Ok(());
    }
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let workers = WorkerPool::spawn(&exe, workers, &dest)?;
    let messages: Vec<String> = (0..jobs).map(|i| format!("job {}", i)).collect();
    for result in workers.map(&messages)? {
        println!("{}", serde_json::to_string(&result)?);
    }
    workers.shutdown()
}

/// Threads exist only in the process that spawned them.
pub fn thread_survival() -> Result<()> {
    let spawn = |name: &'static str| {
        thread::spawn(move || {
            for i in 0..2 {
                println!("{} {} {}", getpid(), i, name);
                thread::sleep(Duration::from_micros(100));
            }
        })
    };
    let t1 = spawn("t1");
    let t2 = spawn("t2");

    println!("a");
    let forked = unsafe { fork::fork() }.context("fork refused")?;
    let me = match forked {
        ForkResult::Child => "child",
        ForkResult::Parent { .. } => "parent",
    };
    let line = match task_count() {
        Some(n) => format!("b {} ({}, {} thread(s))\n", getpid(), me, n),
        None => format!("b {} ({})\n", getpid(), me),
    };
    // t1 or t2 may have owned the stdout lock at the moment of the fork, and
    // in the child nobody would ever give it back
    raw_stdout().write_all(line.as_bytes())?;
    thread::sleep(Duration::from_millis(1));

    match forked {
        ForkResult::Child => unsafe { libc::_exit(0) },
        ForkResult::Parent { child } => {
            let _ = t1.join();
            let _ = t2.join();
            report_child(child)
        }
    }
}

fn raw_stdout() -> ManuallyDrop<File> {
    ManuallyDrop::new(unsafe { File::from_raw_fd(1) })
}

fn raw_stdin() -> ManuallyDrop<File> {
    ManuallyDrop::new(unsafe { File::from_raw_fd(0) })
}

/// Threads of this process, where the OS exposes them.
pub fn task_count() -> Option<usize> {
    std::fs::read_dir("/proc/self/task")
        .ok()
        .map(|entries| entries.count())
}

/// Memory written before the fork is present twice afterwards, unless it was
/// flushed out first.
pub fn buffered_fork(flush: bool) -> Result<()> {
    let mut buf = String::new();
    writeln!(buf, "parent {}", getpid())?;
    if flush {
        let mut out = io::stdout();
        out.write_all(buf.as_bytes())?;
        out.flush()?;
        buf.clear();
    }

    let forked = unsafe { fork::fork() }.context("fork refused")?;
    writeln!(buf, "child {}", getpid())?;
    let mut out = io::stdout();
    out.write_all(buf.as_bytes())?;
    out.flush()?;

    match forked {
        ForkResult::Child => exit_child(0),
        ForkResult::Parent { child } => {
            wait_for(child)?;
            Ok(())
        }
    }
}

/// Both processes read the same inherited stdin descriptor, one byte at a
/// time, and each gets whatever the other did not.
pub fn shared_fd(bytes: usize) -> Result<()> {
    let forked = unsafe { fork::fork() }.context("fork refused")?;

    let mut got = Vec::with_capacity(bytes);
    for _ in 0..bytes {
        let mut byte = [0u8; 1];
        // bypass std's buffered stdin so each read takes exactly one byte
        match raw_stdin().read(&mut byte) {
            Ok(1) => got.push(byte[0]),
            Ok(_) => break,
            Err(e) => return Err(e).context("read from stdin"),
        }
        thread::sleep(Duration::from_micros(100));
    }
    println!("{}: {}", getpid(), String::from_utf8_lossy(&got));

    match forked {
        ForkResult::Child => exit_child(0),
        ForkResult::Parent { child } => {
            wait_for(child)?;
            Ok(())
        }
    }
}
