//! Byte-oriented, delimiter-framed transports.
//!
//! A [`LineIo`] hides the physical connection to a modem (serial port,
//! TCP client or server, UDP socket, pseudo-terminal, or an in-memory
//! pair for tests) behind a non-blocking line interface:
//!
//! * [`LineIo::write`] is best-effort and never blocks; a write may be
//!   fragmented on the wire but a peer never observes a partial line.
//! * [`LineIo::read`] returns one delimited line (or one datagram),
//!   including the end-of-line characters, or `nb::Error::WouldBlock`.
//!
//! Transport failures surface as a [`LineIoError`]; the owning driver
//! translates them into its reset policy. A `LineIo` itself never
//! retries.

use std::fmt;
use std::io;

use thiserror::Error;

pub mod mem;
#[cfg(unix)]
pub mod serial;
pub mod tcp;
pub mod udp;

pub use mem::MemEndpoint;
#[cfg(unix)]
pub use serial::{PtyIo, SerialIo};
pub use tcp::{TcpClientIo, TcpServerIo};
pub use udp::UdpIo;

/// Failure category of a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineIoErrorKind {
    /// The connection could not be established.
    ConnectionFailed,
    /// The connection dropped after it was established.
    Closed,
    /// Read/write failed at the OS level.
    Io,
    /// The transport does not support the requested operation.
    Unsupported,
}

/// Error raised by a transport; see [`LineIoErrorKind`].
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct LineIoError {
    pub kind: LineIoErrorKind,
    pub message: String,
}

impl LineIoError {
    pub fn new(kind: LineIoErrorKind, message: impl Into<String>) -> Self {
        LineIoError {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn from_io(kind: LineIoErrorKind, err: io::Error) -> Self {
        LineIoError {
            kind,
            message: err.to_string(),
        }
    }
}

/// Non-blocking, line-framed transport.
pub trait LineIo: fmt::Debug + Send {
    /// Open the physical connection. Must be called before reads/writes.
    fn start(&mut self) -> Result<(), LineIoError>;

    /// Close the connection; `start` may be called again afterwards.
    fn close(&mut self);

    /// Whether the connection is currently usable.
    fn active(&self) -> bool;

    /// Queue `data` for transmission. Never blocks.
    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError>;

    /// One delimited line (delimiter included) or one datagram, if a full
    /// one is buffered.
    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError>;

    /// Drive DTR on transports with modem-control lines. Default:
    /// unsupported.
    fn set_dtr(&mut self, _state: bool) -> Result<(), LineIoError> {
        Err(LineIoError::new(
            LineIoErrorKind::Unsupported,
            "transport has no DTR line",
        ))
    }
}

/// Connection half of a driver configuration.
#[derive(Debug, Clone)]
pub enum LineIoConfig {
    /// Unix serial device.
    Serial { port: String, baud: u32 },
    /// Outbound TCP connection.
    TcpClient { host: String, port: u16 },
    /// Listening TCP endpoint (lines fan out to every connected client).
    TcpServer { bind: String, port: u16 },
    /// UDP socket with a single remote (e.g. a multicast group).
    Udp {
        bind: String,
        port: u16,
        remote: String,
        remote_port: u16,
    },
    /// Pre-wired in-memory endpoint, for tests and simulators.
    Mem(MemEndpoint),
}

/// Build the transport described by `cfg`, framed by `delimiter`. The
/// returned transport is not yet started.
pub fn connect(cfg: &LineIoConfig, delimiter: &[u8]) -> Result<Box<dyn LineIo>, LineIoError> {
    match cfg {
        #[cfg(unix)]
        LineIoConfig::Serial { port, baud } => {
            Ok(Box::new(SerialIo::new(port.clone(), *baud, delimiter)))
        }
        #[cfg(not(unix))]
        LineIoConfig::Serial { .. } => Err(LineIoError::new(
            LineIoErrorKind::Unsupported,
            "serial transport is unix-only",
        )),
        LineIoConfig::TcpClient { host, port } => {
            Ok(Box::new(TcpClientIo::new(host.clone(), *port, delimiter)))
        }
        LineIoConfig::TcpServer { bind, port } => {
            Ok(Box::new(TcpServerIo::new(bind.clone(), *port, delimiter)))
        }
        LineIoConfig::Udp {
            bind,
            port,
            remote,
            remote_port,
        } => Ok(Box::new(UdpIo::new(
            format!("{bind}:{port}"),
            format!("{remote}:{remote_port}"),
        ))),
        LineIoConfig::Mem(endpoint) => {
            let mut ep = endpoint.clone();
            ep.set_delimiter(delimiter);
            Ok(Box::new(ep))
        }
    }
}

/// Reassembles a byte stream into delimiter-terminated lines.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    /// Scan resume point, so repeated partial reads stay linear.
    scanned: usize,
}

impl LineBuffer {
    pub fn new(delimiter: &[u8]) -> Self {
        debug_assert!(!delimiter.is_empty());
        LineBuffer {
            delimiter: delimiter.to_vec(),
            buf: Vec::new(),
            scanned: 0,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, delimiter included.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let d = self.delimiter.len();
        if self.buf.len() < d {
            return None;
        }
        let start = self.scanned.saturating_sub(d - 1);
        for i in start..=(self.buf.len() - d) {
            if self.buf[i..i + d] == self.delimiter[..] {
                let line: Vec<u8> = self.buf.drain(..i + d).collect();
                self.scanned = 0;
                return Some(line);
            }
        }
        self.scanned = self.buf.len();
        None
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_on_delimiter() {
        let mut lb = LineBuffer::new(b"\r\n");
        lb.extend(b"OK\r\nREA");
        assert_eq!(lb.next_line().as_deref(), Some(b"OK\r\n".as_ref()));
        assert_eq!(lb.next_line(), None);
        lb.extend(b"DY\r\n");
        assert_eq!(lb.next_line().as_deref(), Some(b"READY\r\n".as_ref()));
        assert_eq!(lb.next_line(), None);
    }

    #[test]
    fn delimiter_straddles_reads() {
        let mut lb = LineBuffer::new(b"\r\n");
        lb.extend(b"abc\r");
        assert_eq!(lb.next_line(), None);
        lb.extend(b"\ndef");
        assert_eq!(lb.next_line().as_deref(), Some(b"abc\r\n".as_ref()));
        assert_eq!(lb.buffered(), 3);
    }

    #[test]
    fn single_byte_delimiter() {
        let mut lb = LineBuffer::new(b"\r");
        lb.extend(b"goby\rbye\r");
        assert_eq!(lb.next_line().as_deref(), Some(b"goby\r".as_ref()));
        assert_eq!(lb.next_line().as_deref(), Some(b"bye\r".as_ref()));
        assert_eq!(lb.next_line(), None);
    }
}
