use pool::tcp::TcpConnector;
use pool::Pool;

use anyhow::{anyhow, Result};
use log::warn;

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::net::TcpStream;

/// Digest of a message and the pooled connection that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hashed {
    pub digest: [u8; 32],
    pub connection: u64,
}

fn exchange(stream: &mut TcpStream, len: u16, value: &[u8]) -> io::Result<[u8; 32]> {
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(value)?;

    let mut buf = [0u8; 32];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Ask the hash service for the SHA-256 of `value` over a pooled connection.
///
/// A connection that breaks mid-request is discarded and the request is sent
/// once more over a fresh one.
pub fn hash_value(pool: &Pool<TcpConnector>, value: &[u8]) -> Result<Hashed> {
    let len = u16::try_from(value.len())
        .map_err(|_| anyhow!("Message length exceeds {} bytes", u16::MAX))?;
    if len == 0 {
        return Err(anyhow!("empty messages end the session and cannot be hashed"));
    }

    let mut retried = false;
    loop {
        let mut conn = pool.acquire()?;
        match conn.try_use(|s| exchange(s, len, value)) {
            Ok(digest) => {
                return Ok(Hashed {
                    digest,
                    connection: conn.id(),
                })
            }
            Err(e) if e.is_retryable() && !retried => {
                warn!("connection #{} unusable ({}), retrying", conn.id(), e);
                conn.discard();
                retried = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool::tcp::Destination;
    use std::net::TcpListener;
    use std::thread;

    /// Serves `per_conn` requests per connection with a fake digest (the
    /// message length repeated), for `conns` connections.
    fn fake_service(conns: usize, per_conn: usize) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            for _ in 0..conns {
                let (mut sock, _) = listener.accept().unwrap();
                for _ in 0..per_conn {
                    let mut len = [0u8; 2];
                    if sock.read_exact(&mut len).is_err() {
                        break;
                    }
                    let len = u16::from_le_bytes(len);
                    let mut msg = vec![0u8; len as usize];
                    sock.read_exact(&mut msg).unwrap();
                    sock.write_all(&[len as u8; 32]).unwrap();
                }
            }
        });
        (port, handle)
    }

    fn pool_for(port: u16) -> Pool<TcpConnector> {
        Pool::new(TcpConnector::new(Destination::new("127.0.0.1", port)))
    }

    #[test]
    fn sequential_requests_share_one_connection() {
        let (port, server) = fake_service(1, 2);
        let pool = pool_for(port);
        let first = hash_value(&pool, b"abc").unwrap();
        let second = hash_value(&pool, b"hello").unwrap();
        assert_eq!(first.digest, [3u8; 32]);
        assert_eq!(second.digest, [5u8; 32]);
        assert_eq!(first.connection, second.connection);
        assert_eq!(pool.state().created, 1);
        drop(pool);
        server.join().unwrap();
    }

    #[test]
    fn closed_connection_is_discarded_and_retried() {
        let (port, server) = fake_service(2, 1);
        let pool = pool_for(port);
        let first = hash_value(&pool, b"one").unwrap();
        let second = hash_value(&pool, b"two!").unwrap();
        assert_ne!(first.connection, second.connection);
        assert_eq!(second.digest, [4u8; 32]);
        let state = pool.state();
        assert_eq!((state.created, state.discarded), (2, 1));
        drop(pool);
        server.join().unwrap();
    }

    #[test]
    fn oversized_and_empty_messages_are_rejected() {
        let pool = pool_for(9);
        assert!(hash_value(&pool, &vec![0u8; u16::MAX as usize + 1]).is_err());
        assert!(hash_value(&pool, b"").is_err());
        assert_eq!(pool.state().created, 0);
    }
}
