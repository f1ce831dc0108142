//! Non-blocking TCP transports.
//!
//! The client connects out to a modem presented as a TCP endpoint (many
//! acoustic modems and all the shore-side services speak TCP). The server
//! accepts any number of clients; a written line fans out to every client
//! and reads drain the clients round-robin, which is the behaviour the
//! shore drivers and simulators rely on.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::debug;

use super::{LineBuffer, LineIo, LineIoError, LineIoErrorKind};

#[derive(Debug)]
pub struct TcpClientIo {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    line_buf: LineBuffer,
}

impl TcpClientIo {
    pub fn new(host: String, port: u16, delimiter: &[u8]) -> Self {
        TcpClientIo {
            host,
            port,
            stream: None,
            line_buf: LineBuffer::new(delimiter),
        }
    }
}

impl LineIo for TcpClientIo {
    fn start(&mut self) -> Result<(), LineIoError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        stream.set_nodelay(true).ok();
        debug!("connected to {addr}");
        self.stream = Some(stream);
        self.line_buf.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.line_buf.clear();
    }

    fn active(&self) -> bool {
        self.stream.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LineIoError::new(LineIoErrorKind::Closed, "not connected"))?;
        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream = None;
                Err(LineIoError::from_io(LineIoErrorKind::Io, e))
            }
        }
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            nb::Error::Other(LineIoError::new(LineIoErrorKind::Closed, "not connected"))
        })?;

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.stream = None;
                    return Err(nb::Error::Other(LineIoError::new(
                        LineIoErrorKind::Closed,
                        "peer closed connection",
                    )));
                }
                Ok(n) => self.line_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream = None;
                    return Err(nb::Error::Other(LineIoError::from_io(
                        LineIoErrorKind::Io,
                        e,
                    )));
                }
            }
        }
        self.line_buf.next_line().ok_or(nb::Error::WouldBlock)
    }
}

#[derive(Debug)]
struct ServerClient {
    stream: TcpStream,
    line_buf: LineBuffer,
    peer: String,
}

#[derive(Debug)]
pub struct TcpServerIo {
    bind: String,
    port: u16,
    delimiter: Vec<u8>,
    listener: Option<TcpListener>,
    clients: Vec<ServerClient>,
}

impl TcpServerIo {
    pub fn new(bind: String, port: u16, delimiter: &[u8]) -> Self {
        TcpServerIo {
            bind,
            port,
            delimiter: delimiter.to_vec(),
            listener: None,
            clients: Vec::new(),
        }
    }

    /// Port actually bound (useful with port 0 in tests).
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    stream.set_nodelay(true).ok();
                    debug!("accepted client {peer}");
                    self.clients.push(ServerClient {
                        stream,
                        line_buf: LineBuffer::new(&self.delimiter),
                        peer: peer.to_string(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

impl LineIo for TcpServerIo {
    fn start(&mut self) -> Result<(), LineIoError> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = TcpListener::bind(&addr)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| LineIoError::from_io(LineIoErrorKind::ConnectionFailed, e))?;
        debug!("listening on {addr}");
        self.listener = Some(listener);
        Ok(())
    }

    fn close(&mut self) {
        self.listener = None;
        self.clients.clear();
    }

    fn active(&self) -> bool {
        self.listener.is_some()
    }

    /// Fan the line out to every connected client. Clients whose socket
    /// errors are dropped; the write succeeds if the server is up.
    fn write(&mut self, data: &[u8]) -> Result<(), LineIoError> {
        if self.listener.is_none() {
            return Err(LineIoError::new(LineIoErrorKind::Closed, "not listening"));
        }
        self.accept_pending();
        self.clients.retain_mut(|client| {
            match client.stream.write_all(data) {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping client {}: {e}", client.peer);
                    false
                }
            }
        });
        Ok(())
    }

    fn read(&mut self) -> nb::Result<Vec<u8>, LineIoError> {
        if self.listener.is_none() {
            return Err(nb::Error::Other(LineIoError::new(
                LineIoErrorKind::Closed,
                "not listening",
            )));
        }
        self.accept_pending();

        let mut chunk = [0u8; 4096];
        let mut dead = Vec::new();
        let mut line = None;
        'clients: for (idx, client) in self.clients.iter_mut().enumerate() {
            loop {
                match client.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead.push(idx);
                        break;
                    }
                    Ok(n) => client.line_buf.extend(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("dropping client {}: {e}", client.peer);
                        dead.push(idx);
                        break;
                    }
                }
            }
            if let Some(l) = client.line_buf.next_line() {
                line = Some(l);
                break 'clients;
            }
        }
        for idx in dead.into_iter().rev() {
            let client = self.clients.remove(idx);
            debug!("client {} disconnected", client.peer);
        }
        line.ok_or(nb::Error::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T: LineIo + ?Sized>(io: &mut T) -> Option<Vec<u8>> {
        for _ in 0..200 {
            match io.read() {
                Ok(line) => return Some(line),
                Err(nb::Error::WouldBlock) => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(nb::Error::Other(_)) => return None,
            }
        }
        None
    }

    #[test]
    fn client_server_round_trip() {
        let mut server = TcpServerIo::new("127.0.0.1".into(), 0, b"\r\n");
        server.start().unwrap();
        let port = server.local_port().unwrap();

        let mut client = TcpClientIo::new("127.0.0.1".into(), port, b"\r\n");
        client.start().unwrap();

        client.write(b"hello\r\n").unwrap();
        assert_eq!(drain(&mut server).unwrap(), b"hello\r\n".to_vec());

        server.write(b"world\r\n").unwrap();
        assert_eq!(drain(&mut client).unwrap(), b"world\r\n".to_vec());
    }

    #[test]
    fn client_start_fails_when_no_listener() {
        // bind to an ephemeral port, then close it so nothing listens
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut client = TcpClientIo::new("127.0.0.1".into(), port, b"\r\n");
        let err = client.start().unwrap_err();
        assert_eq!(err.kind, LineIoErrorKind::ConnectionFailed);
        assert!(!client.active());
    }
}
