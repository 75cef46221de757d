mod client;
mod scenarios;
mod workers;

use pool::tcp::Destination;
use pool::ForkPolicy;

use anyhow::Result;
use clap::{Parser, Subcommand};

use std::time::Duration;

/// Experiments with fork, locks, threads and pooled sockets.
#[derive(Parser, Debug)]
#[command(name = "fork-lab", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fork after releasing the pool lock, or with --raw while another
    /// thread holds it
    LockedFork {
        #[arg(long, default_value = "forbid")]
        policy: ForkPolicy,

        /// Fork unchecked while a background thread holds the lock
        #[arg(long)]
        raw: bool,
    },

    /// Fork while a background thread intermittently holds the pool lock
    RacingFork {
        #[arg(long, default_value = "forbid")]
        policy: ForkPolicy,

        /// Stop and join the background thread before forking
        #[arg(long)]
        quiesce: bool,

        /// Upper bound of the random delay before forking
        #[arg(long, default_value_t = 1000)]
        max_delay_ms: u64,
    },

    /// Hash messages over pooled connections, then over worker processes
    SocketPool {
        #[arg(long, env = "HASH_SERVICE_ADDR", default_value = "127.0.0.1:34567")]
        addr: Destination,

        /// Sequential calls made in this process
        #[arg(long, default_value_t = 2)]
        calls: usize,

        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Jobs mapped over the workers
        #[arg(long, default_value_t = 3)]
        jobs: usize,
    },

    /// Serve hash jobs from stdin (started by socket-pool)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        addr: Destination,
    },

    /// Show that only the forking thread exists in the child
    ThreadSurvival,

    /// Show a buffer filled before fork being written by both processes
    BufferedFork {
        /// Write the buffer out before forking, so only the parent has it
        #[arg(long)]
        flush: bool,
    },

    /// Read the inherited stdin from parent and child at once
    SharedFd {
        #[arg(long, default_value_t = 3)]
        bytes: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match Cli::parse().command {
        Commands::LockedFork { policy, raw } => scenarios::locked_fork(policy, raw),
        Commands::RacingFork {
            policy,
            quiesce,
            max_delay_ms,
        } => scenarios::racing_fork(policy, quiesce, Duration::from_millis(max_delay_ms)),
        Commands::SocketPool {
            addr,
            calls,
            workers,
            jobs,
        } => scenarios::socket_pool(addr, calls, workers, jobs),
        Commands::Worker { addr } => workers::run_worker(addr),
        Commands::ThreadSurvival => scenarios::thread_survival(),
        Commands::BufferedFork { flush } => scenarios::buffered_fork(flush),
        Commands::SharedFd { bytes } => scenarios::shared_fd(bytes),
    }
}
