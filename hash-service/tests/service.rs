//! Runs the real service binary and talks to it over TCP.

use pool::tcp::{Destination, TcpConnector};
use pool::Pool;
use sha2::{Digest, Sha256};

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

struct Service {
    child: Child,
    port: u16,
}

impl Drop for Service {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start(extra: &[&str]) -> Service {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let child = Command::new(env!("CARGO_BIN_EXE_hash-service"))
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", port))
        .args(extra)
        .env("RUST_LOG", "warn")
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let service = Service { child, port };

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return service;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("hash-service did not start listening on {}", port);
}

fn hash(stream: &mut TcpStream, msg: &[u8]) -> io::Result<[u8; 32]> {
    stream.write_all(&(msg.len() as u16).to_le_bytes())?;
    stream.write_all(msg)?;
    let mut digest = [0u8; 32];
    stream.read_exact(&mut digest)?;
    Ok(digest)
}

fn sha256(msg: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(msg));
    digest
}

#[test]
fn replies_with_sha256_until_client_ends_session() {
    let service = start(&[]);
    let mut stream = TcpStream::connect(("127.0.0.1", service.port)).unwrap();
    assert_eq!(hash(&mut stream, b"hello").unwrap(), sha256(b"hello"));
    assert_eq!(hash(&mut stream, b"world").unwrap(), sha256(b"world"));

    stream.write_all(&0u16.to_le_bytes()).unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn close_after_forces_a_fresh_pooled_connection() {
    let service = start(&["--close-after", "1"]);
    let pool = Pool::new(TcpConnector::new(Destination::new("127.0.0.1", service.port)));

    let mut lease = pool.acquire().unwrap();
    assert_eq!(lease.try_use(|s| hash(s, b"one")).unwrap(), sha256(b"one"));
    let err = lease.try_use(|s| hash(s, b"two")).unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {}", err);
    assert!(lease.is_broken());
    pool.discard(lease).unwrap();

    let mut lease = pool.acquire().unwrap();
    assert_eq!(lease.id(), 2);
    assert_eq!(lease.try_use(|s| hash(s, b"two")).unwrap(), sha256(b"two"));
    drop(lease);

    let state = pool.state();
    assert_eq!((state.created, state.discarded, state.idle), (2, 1, 1));
}
