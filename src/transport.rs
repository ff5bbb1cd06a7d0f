//! Listener addresses, streams and peer identity.
//!
//! Listener endpoints are `<scheme>:<address>` strings: `ux:<path>`
//! for local sockets and `tcp:<host>:<port>` for TCP. The TLS schemes
//! (`tls:`, `utls:`) belong to an external transport; their addresses
//! and per-socket attributes parse and validate here, but binding one
//! reports the scheme as unavailable.
//!
//! The transport also determines the *user identity* resource
//! accounting runs on: the peer IP for TCP, one shared synthetic
//! identity for all local-socket peers.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use thiserror::Error;

/// The user identity all local-socket peers share.
pub const DEFAULT_USER_ID: &str = "default";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listener address \"{addr}\": {reason}")]
    BadAddress { addr: String, reason: String },
    #[error("transport \"{0}\" is provided by the external transport adapter and is not available in this build")]
    Unavailable(&'static str),
    #[error("unable to bind \"{addr}\": {source}")]
    Bind {
        addr: String,
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Ux,
    Tcp,
    Tls,
    Utls,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ux => "ux",
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Utls => "utls",
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Utls)
    }
}

/// A parsed listener address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr {
    pub scheme: Scheme,
    addr: String,
}

impl ListenAddr {
    pub fn parse(addr: &str) -> Result<ListenAddr, TransportError> {
        let bad = |reason: &str| TransportError::BadAddress {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = addr.split_once(':').ok_or_else(|| bad("missing scheme"))?;
        let scheme = match scheme {
            "ux" => Scheme::Ux,
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "utls" => Scheme::Utls,
            _ => return Err(bad("unknown scheme")),
        };
        match scheme {
            Scheme::Ux => {
                if rest.is_empty() {
                    return Err(bad("empty socket path"));
                }
            }
            Scheme::Tcp | Scheme::Tls | Scheme::Utls => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| bad("expected <host>:<port>"))?;
                if host.is_empty() {
                    return Err(bad("empty host"));
                }
                port.parse::<u16>().map_err(|_| bad("invalid port"))?;
            }
        }
        Ok(ListenAddr {
            scheme,
            addr: addr.to_string(),
        })
    }

    /// The address part after the scheme.
    fn rest(&self) -> &str {
        self.addr
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Per-socket TLS file overrides, meaningful on `tls:`/`utls:` only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsAttrs {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub tc: Option<PathBuf>,
    pub crl: Option<PathBuf>,
}

impl TlsAttrs {
    pub fn is_empty(&self) -> bool {
        self.cert.is_none() && self.key.is_none() && self.tc.is_none() && self.crl.is_none()
    }
}

/// One configured listener endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketConf {
    pub addr: ListenAddr,
    pub tls: TlsAttrs,
}

pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

pub fn bind(conf: &SocketConf) -> Result<Listener, TransportError> {
    match conf.addr.scheme {
        Scheme::Ux => {
            let path = PathBuf::from(conf.addr.rest());
            // A previous instance's socket file would fail the bind.
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            let listener = UnixListener::bind(&path).map_err(|source| TransportError::Bind {
                addr: conf.addr.to_string(),
                source,
            })?;
            Ok(Listener::Unix(listener))
        }
        Scheme::Tcp => {
            let listener =
                TcpListener::bind(conf.addr.rest()).map_err(|source| TransportError::Bind {
                    addr: conf.addr.to_string(),
                    source,
                })?;
            Ok(Listener::Tcp(listener))
        }
        Scheme::Tls => Err(TransportError::Unavailable("tls")),
        Scheme::Utls => Err(TransportError::Unavailable("utls")),
    }
}

impl Listener {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Unix(listener) => listener.set_nonblocking(nonblocking),
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Accept one connection, returning the stream, a printable peer
    /// address and the peer's user identity.
    pub fn accept(&self) -> io::Result<(Stream, String, String)> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((
                    Stream::Unix(stream),
                    "ux:local".to_string(),
                    DEFAULT_USER_ID.to_string(),
                ))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                let user_id = format!("ip:{}", peer.ip());
                Ok((Stream::Tcp(stream), format!("tcp:{peer}"), user_id))
            }
        }
    }
}

pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Stream> {
        Ok(match self {
            Stream::Unix(stream) => Stream::Unix(stream.try_clone()?),
            Stream::Tcp(stream) => Stream::Tcp(stream.try_clone()?),
        })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.read(buf),
            Stream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.write(buf),
            Stream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(stream) => stream.flush(),
            Stream::Tcp(stream) => stream.flush(),
        }
    }
}
