//-
// Copyright (c) 2022, The Mettmail Developers
//
// This file is part of Mettmail.
//
// Mettmail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, version 3 of the License.
//
// Mettmail is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mettmail. If not, see <http://www.gnu.org/licenses/>.

//! Blocking byte streams to the IMAP and LMTP servers.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use openssl::ssl::{
    HandshakeError, SslConnector, SslMethod, SslStream, SslVerifyMode,
};

use super::error::Error;

#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Tls(SslStream<TcpStream>),
    Unix(UnixStream),
}

impl Transport {
    /// Open a TCP connection to `host:port`, trying every address the name
    /// resolves to.
    pub fn connect_tcp(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut last_error = None;
        for address in (host, port).to_socket_addrs()? {
            debug!("Connecting to {} ({})", host, address);
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Transport::Tcp(stream));
                }
                Err(e) => {
                    warn!("Connecting to {} ({}) failed: {}", host, address, e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Io(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "Host not found")
        })))
    }

    pub fn connect_unix(path: &Path) -> Result<Self, Error> {
        debug!("Connecting to {}", path.display());
        Ok(Transport::Unix(UnixStream::connect(path)?))
    }

    /// Perform a TLS handshake over this (so far cleartext) TCP stream.
    ///
    /// The handshake is subject to whatever read timeout is currently set.
    pub fn start_tls(
        self,
        host: &str,
        allow_insecure: bool,
    ) -> Result<Self, Error> {
        let tcp = match self {
            Transport::Tcp(tcp) => tcp,
            Transport::Tls(_) => {
                return Err(Error::Protocol(
                    "TLS requested on a stream which is already encrypted"
                        .to_owned(),
                ))
            }
            Transport::Unix(_) => {
                return Err(Error::Protocol(
                    "TLS is not supported over UNIX sockets".to_owned(),
                ))
            }
        };

        let mut connector = SslConnector::builder(SslMethod::tls_client())?;
        if allow_insecure {
            warn!("Not verifying the TLS certificate of {}", host);
            connector.set_verify(SslVerifyMode::NONE);
        }

        debug!("Starting TLS handshake with {}", host);
        let stream = connector.build().connect(host, tcp).map_err(
            |e| match e {
                HandshakeError::SetupFailure(es) => Error::Ssl(es),
                HandshakeError::Failure(f) => {
                    Error::Handshake(f.into_error().to_string())
                }
                HandshakeError::WouldBlock(_) => {
                    Error::Timeout("TLS handshake")
                }
            },
        )?;
        debug!(
            "TLS established with {}: {}",
            host,
            stream.ssl().version_str()
        );

        Ok(Transport::Tls(stream))
    }

    pub fn set_read_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        match *self {
            Transport::Tcp(ref s) => s.set_read_timeout(timeout),
            Transport::Tls(ref s) => s.get_ref().set_read_timeout(timeout),
            Transport::Unix(ref s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        match *self {
            Transport::Tcp(ref s) => s.set_write_timeout(timeout),
            Transport::Tls(ref s) => s.get_ref().set_write_timeout(timeout),
            Transport::Unix(ref s) => s.set_write_timeout(timeout),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self, Transport::Tls(_))
    }
}

impl From<UnixStream> for Transport {
    fn from(stream: UnixStream) -> Self {
        Transport::Unix(stream)
    }
}

impl Read for Transport {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match *self {
            Transport::Tcp(ref mut s) => s.read(dst),
            Transport::Tls(ref mut s) => s.read(dst),
            Transport::Unix(ref mut s) => s.read(dst),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match *self {
            Transport::Tcp(ref mut s) => s.write(src),
            Transport::Tls(ref mut s) => s.write(src),
            Transport::Unix(ref mut s) => s.write(src),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Transport::Tcp(ref mut s) => s.flush(),
            Transport::Tls(ref mut s) => s.flush(),
            Transport::Unix(ref mut s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starttls_over_unix_socket_is_refused() {
        let (a, _b) = UnixStream::pair().unwrap();
        match Transport::from(a).start_tls("localhost", false) {
            Err(Error::Protocol(_)) => (),
            r => panic!("Unexpected result: {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn unix_transport_passes_bytes_through() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut transport = Transport::from(a);
        assert!(!transport.is_tls());

        transport.write_all(b"LHLO localhost\r\n").unwrap();
        let mut buf = [0u8; 16];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(b"LHLO localhost\r\n", &buf);

        transport
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let err = transport.read(&mut buf).unwrap_err();
        assert!(crate::support::error::is_timeout(&err));
    }
}
