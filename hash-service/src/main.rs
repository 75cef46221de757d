use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use std::io::ErrorKind;

/// Replies to every length-prefixed message with its SHA-256 digest.
#[derive(Parser, Debug)]
#[command(name = "hash-service", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HASH_SERVICE_ADDR", default_value = "127.0.0.1:34567")]
    addr: String,

    /// Close each connection after this many replies
    #[arg(long)]
    close_after: Option<usize>,
}

async fn handle_client(mut socket: TcpStream, close_after: Option<usize>) -> std::io::Result<usize> {
    let mut served = 0;
    loop {
        if close_after.map_or(false, |max| served >= max) {
            break;
        }
        // read a length-encoded input buffer, zero length ends the session
        let len = match socket.read_u16_le().await {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut buf = vec![0u8; len as usize];
        socket.read_exact(&mut buf).await?;
        let result = Sha256::digest(&buf);
        socket.write_all(result.as_slice()).await?;
        served += 1;
    }
    Ok(served)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!("Hash service listening on: {}", listener.local_addr()?);

    loop {
        let (socket, addr) = listener.accept().await?;
        let close_after = args.close_after;
        tokio::spawn(async move {
            match handle_client(socket, close_after).await {
                Ok(served) => debug!("client {} done after {} request(s)", addr, served),
                Err(e) => warn!("Error handling request from client {}: {}", addr, e),
            }
        });
    }
}
