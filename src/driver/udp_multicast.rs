//! Multicast UDP "modem": every node joins one group and each
//! transmission is one serialized [`ModemTransmission`] datagram to the
//! group. Our own datagrams loop back and are rejected by source id.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use log::{debug, warn};

use crate::clock::Clock;
use crate::consts::BROADCAST_ID;
use crate::line_io::udp::MAX_DATAGRAM_BYTES;
use crate::transmission::{ModemRaw, ModemTransmission, TransmissionKind};

use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

#[derive(Debug, Clone)]
pub struct UdpMulticastDriverConfig {
    pub listen_address: Ipv4Addr,
    pub multicast_address: Ipv4Addr,
    pub multicast_port: u16,
    pub max_frame_size: u32,
    /// Per-rate frame size overrides, `(rate, bytes)`.
    pub rate_to_bytes: Vec<(i32, u32)>,
}

impl Default for UdpMulticastDriverConfig {
    fn default() -> Self {
        UdpMulticastDriverConfig {
            listen_address: Ipv4Addr::UNSPECIFIED,
            multicast_address: Ipv4Addr::new(239, 142, 0, 10),
            multicast_port: 50021,
            max_frame_size: 1400,
            rate_to_bytes: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct UdpMulticastDriver {
    base: ModemBase,
    mc_cfg: UdpMulticastDriverConfig,
    socket: Option<UdpSocket>,
    group: SocketAddrV4,
    next_frame: u32,
    shutdown: bool,
}

impl UdpMulticastDriver {
    pub fn new(cfg: DriverConfig, mc_cfg: UdpMulticastDriverConfig, clock: Clock) -> Self {
        let group = SocketAddrV4::new(mc_cfg.multicast_address, mc_cfg.multicast_port);
        UdpMulticastDriver {
            base: ModemBase::new(cfg, clock),
            mc_cfg,
            socket: None,
            group,
            next_frame: 0,
            shutdown: false,
        }
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
        if let Err(e) = socket.send_to(&bytes, self.group) {
            if e.kind() != ErrorKind::WouldBlock {
                warn!("send error to {}: {e}", self.group);
            }
        }
        self.base
            .push_event(DriverEvent::TransmitResult(msg.clone()));
        Ok(())
    }

    fn receive_message(&mut self, msg: ModemTransmission) -> Result<(), DriverError> {
        let wants_our_ack = msg.kind == TransmissionKind::Data
            && msg.wants_ack()
            && msg.dest != BROADCAST_ID
            && msg.dest == self.base.cfg().modem_id;
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

impl ModemDriver for UdpMulticastDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        self.shutdown = false;
        let bind = SocketAddrV4::new(self.mc_cfg.listen_address, self.mc_cfg.multicast_port);
        let socket = UdpSocket::bind(bind)
            .map_err(|e| DriverError::StartupFailed(format!("bind {bind}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DriverError::StartupFailed(e.to_string()))?;
        socket
            .join_multicast_v4(&self.mc_cfg.multicast_address, &self.mc_cfg.listen_address)
            .map_err(|e| DriverError::StartupFailed(format!("join multicast: {e}")))?;
        debug!("joined group {}", self.group);

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
                    self.base.push_event(DriverEvent::RawIncoming(ModemRaw {
                        raw: buf[..n].to_vec(),
                    }));
                    match bincode::deserialize::<ModemTransmission>(&buf[..n]) {
                        // reject our own datagrams coming back off the group
                        Ok(msg) if msg.src == self.base.cfg().modem_id => {
                            debug!("rejecting our own datagram");
                        }
                        Ok(msg) => {
                            debug!("received {n} bytes from {peer}");
                            self.receive_message(msg)?;
                        }
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
            let by_rate = self
                .mc_cfg
                .rate_to_bytes
                .iter()
                .find(|(rate, _)| *rate == msg.rate)
                .map(|(_, bytes)| *bytes);
            msg.max_frame_bytes = Some(by_rate.unwrap_or(self.mc_cfg.max_frame_size));
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
