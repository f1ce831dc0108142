//! Poll-based store-and-forward client.
//!
//! The client batches its outbound transmissions and, every
//! `query_interval`, ships them to the store server as one framed
//! request over a persistent TCP connection; the response carries zero
//! or more inbound transmissions. Silence for `reset_interval` closes
//! and reopens the connection.
//!
//! A transmission whose source is another node becomes a third-party
//! poll: the server runs the data request on behalf of
//! `(poll_src, poll_dest)` and the reply comes back addressed to us.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, TimePoint};
use crate::protocol::rudics;
use crate::transmission::{DriverSpecific, ModemTransmission, TransmissionKind};

use super::{
    DriverConfig, DriverError, DriverEvent, ModemBase, ModemDriver, PayloadSource,
};

/// One poll from a client to the store server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreServerRequest {
    pub modem_id: crate::consts::ModemId,
    pub request_id: u32,
    pub outbox: Vec<ModemTransmission>,
}

/// The server's reply to one [`StoreServerRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreServerResponse {
    pub modem_id: crate::consts::ModemId,
    pub request_id: u32,
    pub inbox: Vec<ModemTransmission>,
}

/// Frame a request/response for the wire (bit-packed, `\r`-terminated).
pub fn serialize_store_server_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, DriverError> {
    let encoded = bincode::serialize(msg)
        .map_err(|e| DriverError::InvalidConfig(format!("serialize failed: {e}")))?;
    Ok(rudics::encode(&encoded))
}

/// Reverse of [`serialize_store_server_message`].
pub fn parse_store_server_message<T: for<'de> Deserialize<'de>>(
    packet: &[u8],
) -> Result<T, String> {
    let bytes = rudics::decode(packet).map_err(|e| e.to_string())?;
    bincode::deserialize(&bytes).map_err(|e| e.to_string())
}

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub query_interval: std::time::Duration,
    pub reset_interval: std::time::Duration,
    pub max_frame_size: u32,
    /// Per-rate frame size, indexed by rate code.
    pub rate_to_bytes: Vec<u32>,
    /// Per-rate frame count, indexed by rate code.
    pub rate_to_frames: Vec<u32>,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        StoreClientConfig {
            query_interval: std::time::Duration::from_secs(1),
            reset_interval: std::time::Duration::from_secs(120),
            max_frame_size: 1400,
            rate_to_bytes: Vec::new(),
            rate_to_frames: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct StoreClientDriver {
    base: ModemBase,
    store_cfg: StoreClientConfig,
    request: StoreServerRequest,
    request_id: u32,
    last_send_time: TimePoint,
    waiting_for_reply: bool,
    next_frame: u32,
    shutdown: bool,
}

impl StoreClientDriver {
    pub fn new(cfg: DriverConfig, store_cfg: StoreClientConfig, clock: Clock) -> Self {
        let now = clock.now();
        let modem_id = cfg.modem_id;
        StoreClientDriver {
            base: ModemBase::new(cfg, clock),
            store_cfg,
            request: StoreServerRequest {
                modem_id,
                ..Default::default()
            },
            request_id: 0,
            last_send_time: now,
            waiting_for_reply: false,
            next_frame: 0,
            shutdown: false,
        }
    }

    fn handle_response(
        &mut self,
        response: StoreServerResponse,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        let now = self.base.clock().now();
        debug!(
            "received response in {:.1} s",
            now.micros_since(self.last_send_time) as f64 / 1.0e6
        );
        self.waiting_for_reply = false;

        for msg in response.inbox {
            // a poll executed on our behalf comes back for redispatch
            if msg.kind == TransmissionKind::DriverSpecific {
                if let Some(DriverSpecific::StorePoll { src, dest }) = msg.driver_specific {
                    if src == self.base.cfg().modem_id {
                        let data_msg = ModemTransmission {
                            src,
                            dest,
                            kind: TransmissionKind::Data,
                            driver_specific: None,
                            ..msg
                        };
                        self.handle_initiate_transmission(&data_msg, source)?;
                        continue;
                    }
                }
                debug!("ignoring driver-specific message not addressed to us");
                continue;
            }

            // ack data packets addressed to us on the next poll
            if msg.dest == self.base.cfg().modem_id
                && msg.kind == TransmissionKind::Data
                && msg.wants_ack()
            {
                let mut ack = ModemTransmission::ack_of(&msg);
                ack.time = Some(now);
                self.request.outbox.push(ack);
            }

            self.base.push_event(DriverEvent::Receive(msg));
        }
        Ok(())
    }
}

impl ModemDriver for StoreClientDriver {
    fn startup(&mut self) -> Result<(), DriverError> {
        self.shutdown = false;
        self.request.modem_id = self.base.cfg().modem_id;
        self.base.modem_start()
    }

    fn shutdown(&mut self) {
        self.shutdown = true;
        self.base.modem_close();
    }

    fn do_work(&mut self, source: &mut dyn PayloadSource) -> Result<(), DriverError> {
        if self.shutdown {
            return Ok(());
        }

        while let Some(line) = self.base.modem_read() {
            match parse_store_server_message::<StoreServerResponse>(&line) {
                Ok(response) => self.handle_response(response, source)?,
                Err(e) => warn!("failed to parse response from store server: {e}"),
            }
        }

        let now = self.base.clock().now();
        if !self.waiting_for_reply
            && now > self.last_send_time + self.store_cfg.query_interval
        {
            self.request.request_id = self.request_id;
            self.request_id += 1;
            debug!("sending poll to server ({} queued)", self.request.outbox.len());
            let bytes = serialize_store_server_message(&self.request)?;
            self.base.modem_write(&bytes)?;
            self.last_send_time = now;
            self.request.outbox.clear();
            self.waiting_for_reply = true;
        } else if self.waiting_for_reply
            && now > self.last_send_time + self.store_cfg.reset_interval
        {
            warn!(
                "no response in {:?}, resetting socket",
                self.store_cfg.reset_interval
            );
            self.base.modem_close();
            self.base.modem_start()?;
            self.waiting_for_reply = false;
        }
        Ok(())
    }

    fn handle_initiate_transmission(
        &mut self,
        orig: &ModemTransmission,
        source: &mut dyn PayloadSource,
    ) -> Result<(), DriverError> {
        if orig.kind != TransmissionKind::Data {
            warn!("not initiating: invalid transmission kind {:?}", orig.kind);
            return Ok(());
        }

        let mut msg = orig.clone();
        source.modify_transmission(&mut msg);

        if self.base.cfg().modem_id == msg.src {
            // our own transmission: fill it and queue for the next poll
            if msg.frame_start.is_none() {
                msg.frame_start = Some(self.next_frame);
            }
            let rate = msg.rate.max(0) as usize;
            msg.max_frame_bytes = Some(
                self.store_cfg
                    .rate_to_bytes
                    .get(rate)
                    .copied()
                    .unwrap_or(self.store_cfg.max_frame_size),
            );
            if let Some(frames) = self.store_cfg.rate_to_frames.get(rate) {
                msg.max_num_frames = *frames;
            }

            if (msg.frames.len() as u32) < msg.max_num_frames {
                source.data_request(&mut msg);
            }
            self.next_frame += msg.frames.len() as u32;

            if !msg.frames_empty() {
                self.request.outbox.push(msg);
            }
        } else {
            // someone else's slot: ask the server to poll on their behalf
            let poll = ModemTransmission {
                src: self.base.cfg().modem_id,
                dest: msg.src,
                kind: TransmissionKind::DriverSpecific,
                driver_specific: Some(DriverSpecific::StorePoll {
                    src: msg.src,
                    dest: msg.dest,
                }),
                ..Default::default()
            };
            self.request.outbox.push(poll);
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
