//! A pool of pre-spawned worker processes.
//!
//! Workers are fresh executions of this binary (`fork-lab worker`), not forks
//! of the caller, so none of them inherits the caller's connection pool, locks
//! or threads. Jobs and results travel as JSON lines over the workers'
//! stdin/stdout.

use crate::client;

use pool::tcp::{Destination, TcpConnector};
use pool::{Builder, ForkPolicy};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel as mpmc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub index: usize,
    pub pid: i32,
    /// Hex-encoded digest, absent when the job failed.
    pub digest: Option<String>,
    pub error: Option<String>,
    pub connection: Option<u64>,
    /// Connections the worker had opened when it finished the job.
    pub connections_opened: u64,
}

/// Body of `fork-lab worker`: hash every job read from stdin with this
/// process's own pool.
pub fn run_worker(dest: Destination) -> Result<()> {
    let pid = nix::unistd::getpid().as_raw();
    let pool = Builder::new()
        .name(format!("worker-{}", pid))
        .policy(ForkPolicy::Reset)
        .build(TcpConnector::new(dest));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let job: Job = serde_json::from_str(&line).context("malformed job")?;
        let result = match client::hash_value(&pool, job.message.as_bytes()) {
            Ok(hashed) => JobResult {
                index: job.index,
                pid,
                digest: Some(hex::encode(hashed.digest)),
                error: None,
                connection: Some(hashed.connection),
                connections_opened: pool.state().created,
            },
            Err(e) => JobResult {
                index: job.index,
                pid,
                digest: None,
                error: Some(format!("{:#}", e)),
                connection: None,
                connections_opened: pool.state().created,
            },
        };
        serde_json::to_writer(&mut out, &result)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    debug!("worker {} saw end of input", pid);
    Ok(())
}

/// Parent-side handle on the worker processes.
pub struct WorkerPool {
    jobs: Option<mpmc::Sender<Job>>,
    results: mpmc::Receiver<Result<JobResult>>,
    dispatchers: Vec<JoinHandle<io::Result<ExitStatus>>>,
}

impl WorkerPool {
    /// Start `count` workers of `exe` talking to `dest`.
    pub fn spawn(exe: &Path, count: usize, dest: &Destination) -> Result<Self> {
        if count == 0 {
            bail!("a worker pool needs at least one worker");
        }
        let (jobs_tx, jobs_rx) = mpmc::unbounded::<Job>();
        let (results_tx, results_rx) = mpmc::unbounded();

        let mut dispatchers = Vec::with_capacity(count);
        for n in 0..count {
            let mut child = Command::new(exe)
                .arg("worker")
                .arg("--addr")
                .arg(dest.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .with_context(|| format!("failed to start worker {}", n))?;
            info!("started worker {} as pid {}", n, child.id());

            let stdin = child.stdin.take().context("worker stdin not piped")?;
            let stdout = child.stdout.take().context("worker stdout not piped")?;
            let jobs = jobs_rx.clone();
            let results = results_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{}", n))
                .spawn(move || dispatch(child, stdin, stdout, jobs, results))?;
            dispatchers.push(handle);
        }

        Ok(WorkerPool {
            jobs: Some(jobs_tx),
            results: results_rx,
            dispatchers,
        })
    }

    /// Hash every message on some worker; results come back in input order.
    pub fn map(&self, messages: &[String]) -> Result<Vec<JobResult>> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("worker pool is shut down"))?;
        for (index, message) in messages.iter().enumerate() {
            jobs.send(Job {
                index,
                message: message.clone(),
            })
            .map_err(|_| anyhow!("all workers are gone"))?;
        }

        let mut results = Vec::with_capacity(messages.len());
        for _ in messages {
            let result = self
                .results
                .recv()
                .map_err(|_| anyhow!("all workers exited before finishing"))??;
            results.push(result);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// Close the workers' input and wait for them to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        drop(self.jobs.take());
        let mut failed = 0;
        for handle in self.dispatchers.drain(..) {
            match handle.join() {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    warn!("worker exited with {}", status);
                    failed += 1;
                }
                Ok(Err(e)) => {
                    warn!("lost worker: {}", e);
                    failed += 1;
                }
                Err(_) => failed += 1,
            }
        }
        if failed > 0 {
            bail!("{} worker(s) did not exit cleanly", failed);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{:#}", e);
        }
    }
}

fn dispatch(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    jobs: mpmc::Receiver<Job>,
    results: mpmc::Sender<Result<JobResult>>,
) -> io::Result<ExitStatus> {
    let mut stdout = BufReader::new(stdout);
    for job in jobs.iter() {
        let index = job.index;
        match round_trip(&mut stdin, &mut stdout, &job) {
            Ok(result) => {
                let _ = results.send(Ok(result));
            }
            Err(e) => {
                let _ = results.send(Err(e.context(format!("job {} lost", index))));
                break;
            }
        }
    }
    drop(stdin);
    child.wait()
}

fn round_trip(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    job: &Job,
) -> Result<JobResult> {
    serde_json::to_writer(&mut *stdin, job)?;
    stdin.write_all(b"\n")?;
    stdin.flush()?;

    let mut line = String::new();
    if stdout.read_line(&mut line)? == 0 {
        bail!("worker closed its output");
    }
    let result: JobResult = serde_json::from_str(&line).context("malformed worker reply")?;
    if result.index != job.index {
        bail!("worker answered job {} instead of {}", result.index, job.index);
    }
    Ok(result)
}
