//! Unicast UDP "modem": one serialized [`ModemTransmission`] per
//! datagram, addressed per-destination from a static peer table.
//!
//! Because the datagram carries the whole transmission, the driver can
//! synthesise application-level ACKs locally: a received transmission
//! that requests one and is addressed to us (or to one of the configured
//! additional ack ids, for spoofing another node) is answered
//! immediately.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use log::{debug, warn};

use crate::clock::Clock;
use crate::consts::{BROADCAST_ID, ModemId};
use crate::line_io::udp::MAX_DATAGRAM_BYTES;
use crate::transmission::{ModemRaw, ModemTransmission, TransmissionKind};

use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

#[derive(Debug, Clone)]
pub struct UdpDriverConfig {
    pub local_port: u16,
    /// Peer modem ids and their endpoints; the broadcast id receives
    /// every transmission.
    pub remotes: Vec<(ModemId, SocketAddr)>,
    pub max_frame_size: u32,
    /// Extra ids we answer ACKs for (spoofing another node).
    pub additional_application_ack_ids: Vec<ModemId>,
}

impl Default for UdpDriverConfig {
    fn default() -> Self {
        UdpDriverConfig {
            local_port: 0,
            remotes: Vec::new(),
            max_frame_size: 1400,
            additional_application_ack_ids: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct UdpDriver {
    base: ModemBase,
    udp_cfg: UdpDriverConfig,
    socket: Option<UdpSocket>,
    application_ack_ids: BTreeSet<ModemId>,
    next_frame: u32,
    shutdown: bool,
}

impl UdpDriver {
    pub fn new(cfg: DriverConfig, udp_cfg: UdpDriverConfig, clock: Clock) -> Self {
        UdpDriver {
            base: ModemBase::new(cfg, clock),
            udp_cfg,
            socket: None,
            application_ack_ids: BTreeSet::new(),
            next_frame: 0,
            shutdown: false,
        }
    }

    /// Port actually bound (useful with port 0 in tests).
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    fn start_send(&mut self, msg: &ModemTransmission) -> Result<(), DriverError> {
        let bytes = bincode::serialize(msg)
            .map_err(|e| DriverError::InvalidConfig(format!("serialize failed: {e}")))?;
        debug!("sending hex: {}", hex::encode(&bytes));
        self.base
            .push_event(DriverEvent::RawOutgoing(ModemRaw { raw: bytes.clone() }));

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| DriverError::ConnectionFailed("socket not bound".into()))?;

        for (id, addr) in &self.udp_cfg.remotes {
            let directed = msg.dest != BROADCAST_ID && *id == msg.dest;
            if *id == BROADCAST_ID || directed {
                if let Err(e) = socket.send_to(&bytes, addr) {
                    if e.kind() != ErrorKind::WouldBlock {
                        warn!("send error to {addr}: {e}");
                    }
                }
            }
        }

        self.base
            .push_event(DriverEvent::TransmitResult(msg.clone()));
        Ok(())
    }

    fn receive_message(&mut self, msg: ModemTransmission) -> Result<(), DriverError> {
        let wants_our_ack = msg.kind != TransmissionKind::Ack
            && msg.wants_ack()
            && self.application_ack_ids.contains(&msg.dest);
        // the receive event precedes the transmit result it provokes
        self.base.push_event(DriverEvent::Receive(msg.clone()));
        if wants_our_ack {
            let mut ack = ModemTransmission::ack_of(&msg);
            ack.time = Some(self.base.clock().now());
            self.start_send(&ack)?;
        }
        Ok(())
    }
}

impl ModemDriver for UdpDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        self.shutdown = false;
        let bind = format!("0.0.0.0:{}", self.udp_cfg.local_port);
        let socket = UdpSocket::bind(&bind)
            .map_err(|e| DriverError::StartupFailed(format!("bind {bind}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DriverError::StartupFailed(e.to_string()))?;

        for (id, addr) in &self.udp_cfg.remotes {
            debug!("receiver {id} at {addr}");
        }

        self.application_ack_ids.clear();
        self.application_ack_ids.insert(self.base.cfg().modem_id);
        self.application_ack_ids
            .extend(&self.udp_cfg.additional_application_ack_ids);

        self.socket = Some(socket);
        self.base
            .set_status(crate::transmission::DriverStatus::Nominal);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdown = true;
        self.socket = None;
    }

    fn do_work(&mut self, _source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        if self.shutdown {
            return Ok(());
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return Ok(());
            };
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    debug!("received {n} bytes from {peer}");
                    self.base.push_event(DriverEvent::RawIncoming(ModemRaw {
                        raw: buf[..n].to_vec(),
                    }));
                    match bincode::deserialize::<ModemTransmission>(&buf[..n]) {
                        Ok(msg) => self.receive_message(msg)?,
                        Err(e) => warn!("undecodable datagram from {peer}: {e}"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("receive error: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_initiate_transmission(
        &mut self,
        orig: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        let mut msg = orig.clone();
        source.modify_transmission(&mut msg);

        if msg.frame_start.is_none() {
            msg.frame_start = Some(self.next_frame);
        }
        if msg.max_frame_bytes.is_none() {
            msg.max_frame_bytes = Some(self.udp_cfg.max_frame_size);
        }
        source.data_request(&mut msg);
        debug!("after modification, initiating transmission with {msg:?}");

        self.next_frame += msg.frames.len() as u32;
        if !msg.frames_empty() {
            self.start_send(&msg)?;
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.base.poll_event()
    }

    fn report(&self) -> crate::transmission::ModemReport {
        self.base.report()
    }
}
