//! The shore-side RUDICS TCP server.
//!
//! The Iridium gateway terminates each mobile RUDICS call as one TCP
//! connection to this server. Connections are identified by a stable
//! slot id until the first decoded message reveals the remote modem id
//! (the driver owns that mapping). Inbound bytes are `\r`-framed; a
//! connection accumulating three consecutive undecodable packets is
//! presumed to be line noise and closed.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{debug, warn};

use crate::line_io::LineBuffer;

/// Bad packets tolerated before the connection is dropped.
const MAX_PACKET_FAILURES: u8 = 3;

/// Stable identifier of one accepted connection.
pub type ConnId = usize;

#[derive(Debug)]
pub enum RudicsEvent {
    Connected(ConnId),
    /// One `\r`-terminated line (terminator included).
    Line(ConnId, Vec<u8>),
    Disconnected(ConnId),
}

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    line_buf: LineBuffer,
    peer: String,
    packet_failures: u8,
}

#[derive(Debug)]
pub struct RudicsServer {
    bind: String,
    port: u16,
    listener: Option<TcpListener>,
    slots: Vec<Option<Connection>>,
}

impl RudicsServer {
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        RudicsServer {
            bind: bind.into(),
            port,
            listener: None,
            slots: Vec::new(),
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        debug!("RUDICS server listening on {addr}");
        self.listener = Some(listener);
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn peer_name(&self, id: ConnId) -> String {
        self.slots
            .get(id)
            .and_then(Option::as_ref)
            .map(|c| c.peer.clone())
            .unwrap_or_else(|| "unknown".into())
    }

    fn allocate(&mut self, conn: Connection) -> ConnId {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(conn);
                return id;
            }
        }
        self.slots.push(Some(conn));
        self.slots.len() - 1
    }

    /// Accept and read; returns what happened this tick.
    pub fn poll(&mut self) -> Vec<RudicsEvent> {
        let mut events = Vec::new();
        if self.listener.is_some() {
            loop {
                let accept_result = self.listener.as_ref().unwrap().accept();
                match accept_result {
                    Ok((stream, peer)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        stream.set_nodelay(true).ok();
                        let conn = Connection {
                            stream,
                            line_buf: LineBuffer::new(b"\r"),
                            peer: peer.to_string(),
                            packet_failures: 0,
                        };
                        let id = self.allocate(conn);
                        debug!("accepted RUDICS connection {id} from {peer}");
                        events.push(RudicsEvent::Connected(id));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        let mut chunk = [0u8; 4096];
        for id in 0..self.slots.len() {
            let Some(conn) = self.slots[id].as_mut() else {
                continue;
            };
            let mut closed = false;
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.line_buf.extend(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("read failed on {}: {e}", conn.peer);
                        closed = true;
                        break;
                    }
                }
            }
            while let Some(line) = conn.line_buf.next_line() {
                events.push(RudicsEvent::Line(id, line));
            }
            if closed {
                debug!("RUDICS connection {id} ({}) closed", conn.peer);
                self.slots[id] = None;
                events.push(RudicsEvent::Disconnected(id));
            }
        }
        events
    }

    /// Write to one connection; false when it is gone.
    pub fn write(&mut self, id: ConnId, data: &[u8]) -> bool {
        let Some(Some(conn)) = self.slots.get_mut(id) else {
            return false;
        };
        match conn.stream.write_all(data) {
            Ok(()) => true,
            Err(e) => {
                warn!("write failed on {}: {e}", conn.peer);
                self.slots[id] = None;
                false
            }
        }
    }

    /// Close a connection deliberately (hangup policy).
    pub fn disconnect(&mut self, id: ConnId) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.take().is_some() {
                debug!("disconnected RUDICS connection {id}");
            }
        }
    }

    /// Record an undecodable packet; closes after three in a row and
    /// returns true when it did.
    pub fn add_packet_failure(&mut self, id: ConnId) -> bool {
        let Some(Some(conn)) = self.slots.get_mut(id) else {
            return true;
        };
        conn.packet_failures += 1;
        if conn.packet_failures >= MAX_PACKET_FAILURES {
            debug!("more than {MAX_PACKET_FAILURES} bad RUDICS packets; closing {id}");
            self.slots[id] = None;
            true
        } else {
            false
        }
    }

    /// Reset the failure counter (a packet decoded fine).
    pub fn clear_packet_failures(&mut self, id: ConnId) {
        if let Some(Some(conn)) = self.slots.get_mut(id) {
            conn.packet_failures = 0;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn close(&mut self) {
        self.listener = None;
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn poll_until<F: FnMut(&mut RudicsServer) -> bool>(server: &mut RudicsServer, mut done: F) {
        for _ in 0..500 {
            if done(server) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never met");
    }

    #[test]
    fn accepts_frames_and_disconnects() {
        let mut server = RudicsServer::new("127.0.0.1", 0);
        server.start().unwrap();
        let port = server.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"goby\rpayload\r").unwrap();

        let mut lines = Vec::new();
        poll_until(&mut server, |s| {
            for ev in s.poll() {
                if let RudicsEvent::Line(_, line) = ev {
                    lines.push(line);
                }
            }
            lines.len() >= 2
        });
        assert_eq!(lines[0], b"goby\r".to_vec());
        assert_eq!(lines[1], b"payload\r".to_vec());

        drop(client);
        let mut disconnected = false;
        poll_until(&mut server, |s| {
            for ev in s.poll() {
                if matches!(ev, RudicsEvent::Disconnected(_)) {
                    disconnected = true;
                }
            }
            disconnected
        });
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn three_strikes_closes_the_connection() {
        let mut server = RudicsServer::new("127.0.0.1", 0);
        server.start().unwrap();
        let port = server.local_port().unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut id = None;
        poll_until(&mut server, |s| {
            for ev in s.poll() {
                if let RudicsEvent::Connected(c) = ev {
                    id = Some(c);
                }
            }
            id.is_some()
        });
        let id = id.unwrap();

        assert!(!server.add_packet_failure(id));
        assert!(!server.add_packet_failure(id));
        assert!(server.add_packet_failure(id));
        assert_eq!(server.connection_count(), 0);
    }
}
