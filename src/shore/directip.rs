//! DirectIP SBD backend: a TCP server accepting the gateway's
//! mobile-originated deliveries and a client POSTing mobile-terminated
//! messages to the gateway.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};

use crate::clock::{Clock, TimePoint};
use crate::driver::DriverError;
use crate::protocol::directip::{
    self, DirectIpReader, IEI_MO_PAYLOAD, IEI_MT_CONFIRMATION,
};

/// Half-open MO connections are dropped after this long.
const MO_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the gateway's MT confirmation.
const MT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DirectIpConfig {
    pub mo_server_bind: String,
    pub mo_server_port: u16,
    pub mt_server_address: String,
    pub mt_server_port: u16,
}

impl Default for DirectIpConfig {
    fn default() -> Self {
        DirectIpConfig {
            mo_server_bind: "0.0.0.0".into(),
            mo_server_port: 10800,
            mt_server_address: "directip.sbd.iridium.com".into(),
            mt_server_port: 10800,
        }
    }
}

#[derive(Debug)]
struct MoConnection {
    stream: TcpStream,
    reader: DirectIpReader,
    connect_time: TimePoint,
    peer: String,
}

#[derive(Debug)]
pub struct DirectIpBackend {
    cfg: DirectIpConfig,
    clock: Clock,
    listener: Option<TcpListener>,
    connections: Vec<MoConnection>,
    client_id: u32,
}

impl DirectIpBackend {
    pub fn new(cfg: DirectIpConfig, clock: Clock) -> Self {
        DirectIpBackend {
            cfg,
            clock,
            listener: None,
            connections: Vec::new(),
            client_id: 0,
        }
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        let addr = format!("{}:{}", self.cfg.mo_server_bind, self.cfg.mo_server_port);
        let listener = TcpListener::bind(&addr)
            .map_err(|e| DriverError::StartupFailed(format!("bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DriverError::StartupFailed(e.to_string()))?;
        debug!("DirectIP MO server listening on {addr}");
        self.listener = Some(listener);
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn close(&mut self) {
        self.listener = None;
        self.connections.clear();
    }

    /// Accept/read gateway connections; returns completed MO payloads.
    pub fn poll_mo(&mut self) -> Vec<Vec<u8>> {
        let mut payloads = Vec::new();
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        self.connections.push(MoConnection {
                            stream,
                            reader: DirectIpReader::new(),
                            connect_time: self.clock.now(),
                            peer: peer.to_string(),
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        let now = self.clock.now();
        let mut chunk = [0u8; 4096];
        self.connections.retain_mut(|conn| {
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => conn.reader.push(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            match conn.reader.take_message() {
                Some(Ok(message)) => {
                    debug!("MO delivery from {}", conn.peer);
                    if let Some(header) = message.mo_header() {
                        debug!(
                            "MO header: imei {} momsn {} status {}",
                            header.imei, header.momsn, header.session_status
                        );
                    }
                    if let Some(payload) = message.element(IEI_MO_PAYLOAD) {
                        payloads.push(payload.to_vec());
                    }
                    false // one message per connection
                }
                Some(Err(e)) => {
                    warn!("bad MO message from {}: {e}", conn.peer);
                    false
                }
                None => {
                    let expired = now.micros_since(conn.connect_time)
                        > MO_TIMEOUT.as_micros() as i64;
                    if expired {
                        debug!("removing timed-out MO connection from {}", conn.peer);
                    }
                    !expired
                }
            }
        });
        payloads
    }

    /// Submit one MT message and wait (bounded) for the confirmation.
    pub fn send_mt(&mut self, payload: &[u8], imei: &str) -> Result<(), DriverError> {
        let client_id = self.client_id;
        self.client_id = self.client_id.wrapping_add(1);

        let message = directip::mt_message(payload, imei, client_id)
            .map_err(|e| DriverError::InvalidConfig(e.to_string()))?;

        let addr = format!(
            "{}:{}",
            self.cfg.mt_server_address, self.cfg.mt_server_port
        );
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| DriverError::ConnectionFailed(format!("resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| DriverError::ConnectionFailed(format!("could not resolve {addr}")))?;

        let mut stream = TcpStream::connect_timeout(&sock_addr, MT_CONFIRM_TIMEOUT)
            .map_err(|e| DriverError::ConnectionFailed(format!("connect {addr}: {e}")))?;
        stream
            .write_all(&message)
            .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?;

        stream
            .set_read_timeout(Some(MT_CONFIRM_TIMEOUT))
            .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?;
        let mut reader = DirectIpReader::new();
        let mut chunk = [0u8; 1024];
        let deadline = std::time::Instant::now() + MT_CONFIRM_TIMEOUT;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    reader.push(&chunk[..n]);
                    if let Some(result) = reader.take_message() {
                        match result {
                            Ok(message) => {
                                if let Some(body) = message.element(IEI_MT_CONFIRMATION) {
                                    debug!("MT confirmation: {}", hex::encode(body));
                                } else {
                                    debug!("MT response without confirmation element");
                                }
                                return Ok(());
                            }
                            Err(e) => {
                                warn!("bad MT confirmation: {e}");
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("MT confirmation read failed: {e}");
                    break;
                }
            }
            if std::time::Instant::now() > deadline {
                break;
            }
        }
        warn!("timeout waiting for confirmation from the DirectIP server");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::directip::mo_message;

    const IMEI: &str = "300234010753370";

    #[test]
    fn mo_delivery_round_trip() {
        let clock = Clock::real();
        let mut backend = DirectIpBackend::new(
            DirectIpConfig {
                mo_server_bind: "127.0.0.1".into(),
                mo_server_port: 0,
                ..Default::default()
            },
            clock,
        );
        backend.start().unwrap();
        let port = backend.local_port().unwrap();

        let msg = mo_message(b"sbd payload", IMEI, 1, 7, 0, 12).unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(&msg).unwrap();

        let mut payloads = Vec::new();
        for _ in 0..500 {
            payloads.extend(backend.poll_mo());
            if !payloads.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(payloads, vec![b"sbd payload".to_vec()]);
    }

    #[test]
    fn mt_send_reads_confirmation() {
        // stand in for the gateway
        let gateway = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = gateway.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = gateway.accept().unwrap();
            let mut reader = DirectIpReader::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                reader.push(&chunk[..n]);
                if let Some(Ok(message)) = reader.take_message() {
                    let confirm =
                        directip::mt_confirmation(0, IMEI, 1, 1).unwrap();
                    stream.write_all(&confirm).unwrap();
                    return message;
                }
            }
        });

        let clock = Clock::real();
        let mut backend = DirectIpBackend::new(
            DirectIpConfig {
                mo_server_bind: "127.0.0.1".into(),
                mo_server_port: 0,
                mt_server_address: "127.0.0.1".into(),
                mt_server_port: port,
            },
            clock,
        );
        backend.start().unwrap();
        backend.send_mt(b"mt payload", IMEI).unwrap();

        let message = handle.join().unwrap();
        assert_eq!(
            message.element(crate::protocol::directip::IEI_MT_PAYLOAD),
            Some(b"mt payload".as_ref())
        );
    }
}
