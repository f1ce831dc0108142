//! UDP datagram transport.
//!
//! One "line" is one datagram; no delimiter is involved. Drivers with a
//! single remote endpoint (notably the multicast driver, whose remote is
//! the group address) run over this transport. The unicast UDP driver
//! addresses datagrams per-destination and therefore owns its socket
//! directly.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use log::debug;

use super::{LineIo, LineIoError, LineIoErrorKind};

/// Largest datagram we are prepared to receive.
pub const MAX_DATAGRAM_BYTES: usize = 65_536;

#[derive(Debug)]
pub struct UdpIo {
    bind: String,
    remote: String,
    socket: Option<UdpSocket>,
    remote_addr: Option<SocketAddr>,
    /// Optional multicast group to join on start.
    multicast_group: Option<Ipv4Addr>,
}

impl UdpIo {
    pub fn new(bind: String, remote: String) -> Self {
        UdpIo {
            bind,
            remote,
            socket: None,
            remote_addr: None,
            multicast_group: None,
        }
    }

    /// Join `group` on the default interface at start.
    pub fn with_multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.multicast_group = Some(group);
        self
    }

    /// Port actually bound (useful with port 0 in tests).
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    fn resolve(addr: &str) -> Result<SocketAddr, LineIoError> {
        addr.to_socket_addrs()
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?
            .next()
            .ok_or_else(|| {
                LineIoError::new(
                    LineIoErrorKind::ConnectionFailed,
                    format!("could not resolve {addr}"),
                )
            })
    }
}

impl LineIo for UdpIo {
    fn start(&mut self) -> Result<(), LineIoError> {
        let socket = UdpSocket::bind(&self.bind)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;

        if let Some(group) = self.multicast_group {
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        }

        self.remote_addr = Some(Self::resolve(&self.remote)?);
        debug!("udp bound {} -> {}", self.bind, self.remote);
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
        self.remote_addr = None;
    }

    fn active(&self) -> bool {
        self.socket.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| LineIoError::new(LineIoErrorKind::Closed, "not bound"))?;
        let remote = self
            .remote_addr
            .ok_or_else(|| LineIoError::new(LineIoErrorKind::Closed, "no remote"))?;
        match socket.send_to(data, remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()), // best effort
            Err(e) => Err(LineIoError::from_io(LineIoErrorKind::Io, e)),
        }
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            nb::Error::Other(LineIoError::new(LineIoErrorKind::Closed, "not bound"))
        })?;
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(LineIoError::from_io(
                LineIoErrorKind::Io,
                e,
            ))),
        }
    }
}
