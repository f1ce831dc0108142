//! Shore-side Iridium driver.
//!
//! The symmetric peer of the mobile [`crate::driver::iridium`] driver,
//! run as a server: a TCP endpoint terminates RUDICS calls relayed by
//! the gateway, and an SBD backend (DirectIP or RockBLOCK) carries the
//! single-packet traffic. Each known remote node gets call-liveness
//! bookkeeping mirroring the mobile side (`bye` handshake, hangup by
//! disconnecting the TCP session).
//!
//! A freshly accepted RUDICS connection is anonymous until the first
//! decoded transmission reveals the remote modem id; from then on
//! outgoing traffic for that id rides the mapped connection.

use std::collections::HashMap;

use log::{debug, warn};

use crate::clock::Clock;
use crate::consts::ModemId;
use crate::driver::iridium::fsm::OnCallStats;
use crate::driver::iridium::{RATE_RUDICS, RATE_SBD};
use crate::driver::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};
use crate::protocol::{header, rudics};
use crate::transmission::{ModemTransmission, TransmissionKind};

pub mod directip;
#[cfg(feature = "rockblock")]
pub mod rockblock;
pub mod rudics_server;

pub use directip::{DirectIpBackend, DirectIpConfig};
#[cfg(feature = "rockblock")]
pub use rockblock::{RockBlockBackend, RockBlockConfig};
pub use rudics_server::{ConnId, RudicsEvent, RudicsServer};

/// Which service carries the SBD traffic.
#[derive(Debug, Clone)]
pub enum SbdBackendConfig {
    DirectIp(DirectIpConfig),
    #[cfg(feature = "rockblock")]
    RockBlock(RockBlockConfig),
}

#[derive(Debug)]
enum SbdBackend {
    DirectIp(DirectIpBackend),
    #[cfg(feature = "rockblock")]
    RockBlock(RockBlockBackend),
}

#[derive(Debug, Clone)]
pub struct ShoreConfig {
    pub rudics_server_bind: String,
    pub rudics_server_port: u16,
    pub sbd: SbdBackendConfig,
    /// Which IMEI each mobile modem id answers on, for MT routing.
    pub modem_id_to_imei: Vec<(ModemId, String)>,
    pub max_frame_size: u32,
    pub target_bit_rate: u32,
    pub handshake_hangup_seconds: f64,
    pub hangup_seconds_after_empty: f64,
}

impl Default for ShoreConfig {
    fn default() -> Self {
        ShoreConfig {
            rudics_server_bind: "0.0.0.0".into(),
            rudics_server_port: 40001,
            sbd: SbdBackendConfig::DirectIp(DirectIpConfig::default()),
            modem_id_to_imei: Vec::new(),
            max_frame_size: 300,
            target_bit_rate: 2400,
            handshake_hangup_seconds: 30.0,
            hangup_seconds_after_empty: 30.0,
        }
    }
}

#[derive(Debug)]
pub struct IridiumShoreDriver {
    base: ModemBase,
    shore_cfg: ShoreConfig,
    rudics: RudicsServer,
    backend: SbdBackend,
    /// modem id <-> RUDICS connection, installed at first decode.
    clients: Vec<(ModemId, ConnId)>,
    /// Call-liveness per remote node.
    remote: HashMap<ModemId, OnCallStats>,
    next_frame: u32,
    rudics_mac_msg: ModemTransmission,
    shutdown: bool,
}

impl IridiumShoreDriver {
    pub fn new(cfg: DriverConfig, shore_cfg: ShoreConfig, clock: Clock) -> Self {
        let rudics = RudicsServer::new(
            shore_cfg.rudics_server_bind.clone(),
            shore_cfg.rudics_server_port,
        );
        let backend = match &shore_cfg.sbd {
            SbdBackendConfig::DirectIp(di) => {
                SbdBackend::DirectIp(DirectIpBackend::new(di.clone(), clock.clone()))
            }
            #[cfg(feature = "rockblock")]
            SbdBackendConfig::RockBlock(rb) => {
                SbdBackend::RockBlock(RockBlockBackend::new(rb.clone()))
            }
        };
        let rudics_mac_msg = ModemTransmission {
            src: cfg.modem_id,
            kind: TransmissionKind::Data,
            rate: RATE_RUDICS,
            ..Default::default()
        };
        IridiumShoreDriver {
            base: ModemBase::new(cfg, clock),
            shore_cfg,
            rudics,
            backend,
            clients: Vec::new(),
            remote: HashMap::new(),
            next_frame: 0,
            rudics_mac_msg,
            shutdown: false,
        }
    }

    /// Port the RUDICS server actually bound.
    pub fn rudics_local_port(&self) -> Option<u16> {
        self.rudics.local_port()
    }

    /// Port the DirectIP MO server actually bound, when that backend is
    /// configured.
    pub fn directip_mo_port(&self) -> Option<u16> {
        match &self.backend {
            SbdBackend::DirectIp(backend) => backend.local_port(),
            #[cfg(feature = "rockblock")]
            SbdBackend::RockBlock(_) => None,
        }
    }

    fn now_seconds(&self) -> f64 {
        self.base.clock().now().unix_seconds_f64()
    }

    fn connection_for(&self, id: ModemId) -> Option<ConnId> {
        self.clients
            .iter()
            .find(|(modem, _)| *modem == id)
            .map(|(_, conn)| *conn)
    }

    fn modem_for(&self, conn: ConnId) -> Option<ModemId> {
        self.clients
            .iter()
            .find(|(_, c)| *c == conn)
            .map(|(id, _)| *id)
    }

    fn drop_connection_state(&mut self, conn: ConnId) {
        if let Some(id) = self.modem_for(conn) {
            debug!(
                "dropping client for modem id {id}; {} clients remaining",
                self.rudics.connection_count()
            );
            self.remote.remove(&id);
        }
        self.clients.retain(|(_, c)| *c != conn);
    }

    fn rudics_send(&mut self, data: &[u8], id: ModemId) {
        match self.connection_for(id) {
            Some(conn) => {
                debug!("RUDICS sending {} bytes to modem {id}", data.len());
                if !self.rudics.write(conn, data) {
                    self.drop_connection_state(conn);
                }
            }
            None => warn!("failed to find connection for modem id {id}"),
        }
    }

    fn rudics_line(&mut self, conn: ConnId, line: Vec<u8>) {
        // the gateway sometimes prepends a NUL to the first line
        if line == b"goby\r" || line == b"\0goby\r" {
            debug!(
                "detected start of RUDICS connection from {}",
                self.rudics.peer_name(conn)
            );
            return;
        }
        if line == b"bye\r" {
            match self.modem_for(conn) {
                Some(id) => {
                    debug!("detected bye from modem id {id}");
                    if let Some(stats) = self.remote.get_mut(&id) {
                        stats.bye_received = true;
                    }
                }
                None => warn!("bye from a connection not yet mapped"),
            }
            return;
        }

        match rudics::decode(&line).and_then(|bytes| header::parse_modem_message(&bytes)) {
            Ok(msg) => {
                self.rudics.clear_packet_failures(conn);
                debug!(
                    "received RUDICS message from {} to {}",
                    msg.src, msg.dest
                );
                if self.connection_for(msg.src).is_none() {
                    self.clients.push((msg.src, conn));
                    self.remote.insert(
                        msg.src,
                        OnCallStats {
                            last_tx_time: self.now_seconds(),
                            ..OnCallStats::default()
                        },
                    );
                }
                if let Some(stats) = self.remote.get_mut(&msg.src) {
                    stats.last_rx_time = self.base.clock().now().unix_seconds_f64();
                }
                self.receive(msg);
            }
            Err(e) => {
                debug!("could not decode packet: {e}");
                if self.rudics.add_packet_failure(conn) {
                    self.drop_connection_state(conn);
                }
            }
        }
    }

    fn receive(&mut self, msg: ModemTransmission) {
        let wants_our_ack = msg.kind == TransmissionKind::Data
            && msg.wants_ack()
            && msg.dest == self.base.cfg().modem_id;
        // the receive event precedes the transmit result it provokes
        self.base.push_event(DriverEvent::Receive(msg.clone()));
        if wants_our_ack {
            let mut ack = ModemTransmission::ack_of(&msg);
            ack.time = Some(self.base.clock().now());
            self.send(&ack);
        }
    }

    fn send(&mut self, msg: &ModemTransmission) {
        let on_call = self.remote.contains_key(&msg.dest);
        if msg.rate == RATE_RUDICS || on_call {
            let bytes = match header::serialize_modem_message(msg) {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot serialize transmission: {e}");
                    return;
                }
            };
            let packet = rudics::encode(&bytes);
            self.rudics_send(&packet, msg.dest);
            let now = self.now_seconds();
            if let Some(stats) = self.remote.get_mut(&msg.dest) {
                stats.last_tx_time = now;
                stats.last_bytes_sent = packet.len();
                stats.total_bytes_sent += packet.len();
            }
        } else if msg.rate == RATE_SBD {
            let imei = self
                .shore_cfg
                .modem_id_to_imei
                .iter()
                .find(|(id, _)| *id == msg.dest)
                .map(|(_, imei)| imei.clone());
            let Some(imei) = imei else {
                warn!(
                    "no IMEI configured for destination {} so unable to send SBD message",
                    msg.dest
                );
                return;
            };
            let payload = match header::serialize_modem_message(msg) {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot serialize transmission: {e}");
                    return;
                }
            };
            let result = match &mut self.backend {
                SbdBackend::DirectIp(backend) => backend.send_mt(&payload, &imei),
                #[cfg(feature = "rockblock")]
                SbdBackend::RockBlock(backend) => backend.send_mt(&payload, &imei),
            };
            if let Err(e) = result {
                warn!("could not send MT SBD message: {e}");
            }
        } else {
            warn!("invalid rate {} for the shore driver", msg.rate);
        }
        self.base.push_event(DriverEvent::TransmitResult(msg.clone()));
    }

    fn process_transmission(
        &mut self,
        orig: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) {
        let mut msg = orig.clone();
        source.modify_transmission(&mut msg);

        if msg.frame_start.is_none() {
            msg.frame_start = Some(self.next_frame);
        }
        let max = self.shore_cfg.max_frame_size;
        if msg.max_frame_bytes.is_none_or(|b| b > max) {
            msg.max_frame_bytes = Some(max);
        }

        source.data_request(&mut msg);
        self.next_frame += msg.frames.len() as u32;

        if !msg.frames_empty() {
            self.send(&msg);
        }
    }

    fn service_calls(&mut self, source: &mut dyn PayloadSource) {
        let now = self.now_seconds();
        let ids: Vec<ModemId> = self.remote.keys().copied().collect();
        for id in ids {
            let Some(stats) = self.remote.get(&id).copied() else {
                continue;
            };

            // keep pushing data at the target rate while the call is up
            let send_wait =
                stats.last_bytes_sent as f64 / (self.shore_cfg.target_bit_rate as f64 / 8.0);
            if now > stats.last_tx_time + send_wait && !stats.bye_sent {
                let mut template = self.rudics_mac_msg.clone();
                template.dest = id;
                self.process_transmission(&template, source);
            }

            let Some(stats) = self.remote.get(&id).copied() else {
                continue;
            };
            if !stats.bye_sent
                && now > stats.last_tx_time + self.shore_cfg.handshake_hangup_seconds
            {
                debug!("sending bye to modem {id}");
                self.rudics_send(b"bye\r", id);
                if let Some(stats) = self.remote.get_mut(&id) {
                    stats.bye_sent = true;
                }
            }

            let Some(stats) = self.remote.get(&id).copied() else {
                continue;
            };
            if (stats.bye_received && stats.bye_sent)
                || now > stats.last_rx_tx_time() + self.shore_cfg.hangup_seconds_after_empty
            {
                debug!("hanging up modem {id} by disconnecting");
                if let Some(conn) = self.connection_for(id) {
                    self.rudics.disconnect(conn);
                    self.drop_connection_state(conn);
                } else {
                    warn!("failed to find connection for modem id {id}");
                    self.remote.remove(&id);
                }
            }
        }
    }
}

impl ModemDriver for IridiumShoreDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        debug!("shore Iridium RUDICS/SBD driver starting up");
        self.shutdown = false;
        self.rudics
            .start()
            .map_err(|e| DriverError::StartupFailed(e.to_string()))?;
        match &mut self.backend {
            SbdBackend::DirectIp(backend) => backend.start()?,
            #[cfg(feature = "rockblock")]
            SbdBackend::RockBlock(backend) => backend.start()?,
        }
        self.base
            .set_status(crate::transmission::DriverStatus::Nominal);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdown = true;
        self.rudics.close();
        match &mut self.backend {
            SbdBackend::DirectIp(backend) => backend.close(),
            #[cfg(feature = "rockblock")]
            SbdBackend::RockBlock(backend) => backend.close(),
        }
        self.clients.clear();
        self.remote.clear();
    }

    fn do_work(&mut self, source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        if self.shutdown {
            return Ok(());
        }

        self.service_calls(source);

        for event in self.rudics.poll() {
            match event {
                RudicsEvent::Connected(conn) => {
                    debug!("new RUDICS connection {conn}");
                }
                RudicsEvent::Line(conn, line) => {
                    self.base
                        .push_event(DriverEvent::RawIncoming(crate::transmission::ModemRaw {
                            raw: line.clone(),
                        }));
                    self.rudics_line(conn, line);
                }
                RudicsEvent::Disconnected(conn) => self.drop_connection_state(conn),
            }
        }

        let payloads = match &mut self.backend {
            SbdBackend::DirectIp(backend) => backend.poll_mo(),
            #[cfg(feature = "rockblock")]
            SbdBackend::RockBlock(backend) => backend
                .poll_mo()
                .into_iter()
                .map(|cb| cb.payload)
                .collect(),
        };
        for payload in payloads {
            match header::parse_modem_message(&payload) {
                Ok(msg) => {
                    debug!("rx SBD transmission from {}", msg.src);
                    self.receive(msg);
                }
                Err(e) => warn!("could not decode SBD packet: {e}"),
            }
        }
        Ok(())
    }

    fn handle_initiate_transmission(
        &mut self,
        msg: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        self.process_transmission(msg, source);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.base.poll_event()
    }

    fn report(&self) -> crate::transmission::ModemReport {
        self.base.report()
    }
}
