//! TCP connection factory.

use crate::blocking::Connect;

use log::debug;

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Where connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Destination {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Destination {
    type Err = String;

    /// Parses `host:port`; the host may be a bracketed IPv6 literal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("`{}` is not host:port", s))?;
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in `{}`", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in `{}`", s));
        }
        Ok(Destination::new(host, port))
    }
}

/// Opens blocking `TcpStream`s to one destination.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    dest: Destination,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(dest: Destination) -> Self {
        TcpConnector {
            dest,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read and write timeout of opened streams; `None` blocks forever.
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.dest
    }
}

impl Connect for TcpConnector {
    type Conn = TcpStream;
    type Err = io::Error;

    /// Tries each resolved address in order; the first that connects wins.
    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.dest.host.as_str(), self.dest.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    stream.set_nodelay(true)?;
                    debug!("connected to {} ({})", self.dest, addr);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.dest),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::Pool;
    use crate::error::Error;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            "localhost:80".parse::<Destination>(),
            Ok(Destination::new("localhost", 80))
        );
        assert_eq!(
            "[::1]:8080".parse::<Destination>(),
            Ok(Destination::new("::1", 8080))
        );
        assert!("localhost".parse::<Destination>().is_err());
        assert!(":80".parse::<Destination>().is_err());
        assert!("host:http".parse::<Destination>().is_err());
    }

    #[test]
    fn pooled_stream_is_reused_across_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // echo one byte per request, count accepted connections
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1];
            let mut served = 0;
            while sock.read_exact(&mut buf).is_ok() {
                sock.write_all(&buf).unwrap();
                served += 1;
            }
            served
        });

        let pool = Pool::new(TcpConnector::new(Destination::new("127.0.0.1", port)));
        for byte in b"abc" {
            let mut lease = pool.acquire().unwrap();
            let echoed = lease
                .try_use(|s| {
                    s.write_all(&[*byte])?;
                    let mut buf = [0u8; 1];
                    s.read_exact(&mut buf)?;
                    Ok(buf[0])
                })
                .unwrap();
            assert_eq!(echoed, *byte);
        }
        assert_eq!(pool.state().created, 1);

        drop(pool);
        assert_eq!(server.join().unwrap(), 3);
    }

    #[test]
    fn refused_connection_surfaces_as_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = TcpConnector::new(Destination::new("127.0.0.1", port))
            .connect_timeout(Duration::from_millis(500));
        assert_eq!(connector.destination().to_string(), format!("127.0.0.1:{}", port));
        let pool = Pool::new(connector);
        assert!(matches!(pool.acquire(), Err(Error::Connect(_))));
        assert_eq!(pool.state().borrowed, 0);
    }
}
