//! The selector that owns every queue and answers driver data requests.
//!
//! A data request is filled one frame at a time: within a frame, encoded
//! messages are packed back-to-back while any queue stays eligible. The
//! first selected message pins the packet's destination and ACK flag
//! ("the first user frame sets the tone"); later selections must be
//! compatible with it.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};

use crate::clock::Clock;
use crate::codec::Codec;
use crate::consts::{BROADCAST_ID, ModemId, QUERY_DESTINATION_ID};
use crate::transmission::{ModemTransmission, TransmissionKind};

use super::queue::{EntryMeta, Queue, QueueConfig, Role};
use super::QueueError;

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub modem_id: ModemId,
    /// ACK-wait bindings older than this are released so the data gets
    /// another chance on the air.
    pub minimum_ack_wait: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        QueueManagerConfig {
            modem_id: 1,
            minimum_ack_wait: Duration::from_secs(120),
        }
    }
}

/// Delivery outcome and bookkeeping notifications toward the application.
#[derive(Debug, Clone)]
pub enum QueueEvent<M> {
    /// A message decoded from the link (or looped back locally).
    Receive(M),
    /// `orig` was acknowledged by the transmission `ack`.
    Ack { ack: ModemTransmission, orig: M },
    /// `orig` exceeded its TTL before delivery (or before its ACK).
    Expire(M),
    /// A queue changed size (push, pop, ack, or expiry).
    QueueSizeChange { message_id: u32, size: usize },
}

#[derive(Debug)]
pub struct QueueManager<C: Codec> {
    cfg: QueueManagerConfig,
    clock: Clock,
    codec: C,
    /// Queues in registration order; order is the priority tie-break.
    queues: Vec<Queue<C::Message>>,
    events: VecDeque<QueueEvent<C::Message>>,
}

impl<C: Codec> QueueManager<C> {
    pub fn new(cfg: QueueManagerConfig, codec: C, clock: Clock) -> Self {
        QueueManager {
            cfg,
            clock,
            codec,
            queues: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn modem_id(&self) -> ModemId {
        self.cfg.modem_id
    }

    /// Register a queue. Must precede pushing or receiving its type.
    pub fn add_queue(&mut self, cfg: QueueConfig) {
        debug!("adding queue [[{}]] for message id {}", cfg.name, cfg.message_id);
        self.queues.push(Queue::new(cfg, self.clock.clone()));
    }

    pub fn queue_size(&self, message_id: u32) -> Option<usize> {
        self.queue(message_id).map(Queue::len)
    }

    fn queue(&self, message_id: u32) -> Option<&Queue<C::Message>> {
        self.queues.iter().find(|q| q.cfg().message_id == message_id)
    }

    fn queue_mut(&mut self, message_id: u32) -> Option<&mut Queue<C::Message>> {
        self.queues
            .iter_mut()
            .find(|q| q.cfg().message_id == message_id)
    }

    /// Drain the next pending application event.
    pub fn poll_event(&mut self) -> Option<QueueEvent<C::Message>> {
        self.events.pop_front()
    }

    fn role_value(&self, role: &Role, msg: &C::Message, what: &str) -> Result<Option<i64>, QueueError> {
        match role {
            Role::Unset => Ok(None),
            Role::Static(v) => Ok(Some(*v)),
            Role::Field(name) => {
                self.codec
                    .field(msg, name)
                    .map(Some)
                    .ok_or_else(|| {
                        QueueError::InvalidRole(format!("no field {name} for role {what}"))
                    })
            }
        }
    }

    /// Push a message; metadata comes from the queue's role mapping.
    ///
    /// Messages addressed to this node bypass the transport entirely:
    /// the receive event (and, when requested, a synthetic ACK) fires
    /// without a driver in the loop.
    pub fn push_message(&mut self, msg: C::Message) -> Result<(), QueueError> {
        let message_id = self.codec.message_id(&msg);
        let q = self
            .queue(message_id)
            .ok_or(QueueError::NoSuchQueue(message_id))?;
        let qcfg = q.cfg().clone();

        let dest = self
            .role_value(&qcfg.dest_role, &msg, "destination")?
            .map(|v| v as ModemId)
            .unwrap_or(BROADCAST_ID);
        let src = self
            .role_value(&qcfg.src_role, &msg, "source")?
            .map(|v| v as ModemId)
            .unwrap_or(self.cfg.modem_id);
        let time = self
            .role_value(&qcfg.time_role, &msg, "timestamp")?
            .map(crate::clock::TimePoint::from_unix_micros)
            .unwrap_or_else(|| self.clock.now());

        debug!(
            "{}: attempting to push message (destination: {dest})",
            qcfg.name
        );

        // message is to us: loop back instead of the physical interface
        if dest == self.cfg.modem_id {
            debug!("message is for us: using loopback, not physical interface");
            self.events.push_back(QueueEvent::Receive(msg.clone()));
            if qcfg.ack {
                let ack = ModemTransmission {
                    src: dest,
                    dest,
                    time: Some(self.clock.now()),
                    kind: TransmissionKind::Ack,
                    ..Default::default()
                };
                self.events.push_back(QueueEvent::Ack { ack, orig: msg });
            }
            return Ok(());
        }

        let encoded = self.codec.encode(&msg)?;
        if encoded.is_empty() {
            return Err(QueueError::EmptyMessage(qcfg.name));
        }

        let meta = EntryMeta {
            src,
            dest,
            time,
            ack_requested: qcfg.ack,
            non_repeated_size: encoded.len(),
            last_sent_time: None,
        };
        let q = self
            .queue_mut(message_id)
            .ok_or(QueueError::NoSuchQueue(message_id))?;
        let dropped = q.push_entry(msg, encoded, meta);
        let size = q.len();
        if let Some(dropped) = dropped {
            // an overflow eviction is an expiry from the application's
            // point of view: the push will never produce an ack or rx
            self.events.push_back(QueueEvent::Expire(dropped));
        }
        self.events.push_back(QueueEvent::QueueSizeChange { message_id, size });
        Ok(())
    }

    /// Fill `msg.frames` with the highest-priority eligible traffic.
    pub fn handle_modem_data_request(&mut self, msg: &mut ModemTransmission) {
        let start_frame = msg.frame_start.unwrap_or(0);
        for q in &mut self.queues {
            q.clear_ack_queue(start_frame, self.cfg.minimum_ack_wait);
        }

        let max_frame_bytes = match msg.max_frame_bytes {
            Some(b) => b,
            None => {
                debug!("data request without max_frame_bytes; nothing to do");
                return;
            }
        };

        let mut packet_dest = msg.dest;
        let mut packet_ack = msg.ack_requested;

        let first_new_frame = msg.frames.len() as u32;
        for frame_offset in first_new_frame..msg.max_num_frames.max(1) {
            let frame_number = start_frame + frame_offset;
            let mut frame_data: Vec<u8> = Vec::new();

            loop {
                let Some(winner) = self.find_next_sender(
                    max_frame_bytes,
                    packet_dest,
                    packet_ack,
                    frame_data.len(),
                ) else {
                    break;
                };

                let message_id = self.queues[winner].cfg().message_id;
                let Some(given) = self.queues[winner].give_data(frame_number) else {
                    break;
                };
                frame_data.extend_from_slice(&given.encoded);

                // the first user frame sets the packet's tone
                if packet_dest == QUERY_DESTINATION_ID {
                    packet_dest = given.dest;
                }
                packet_ack = Some(packet_ack.unwrap_or(false) || given.ack_requested);

                let size = self.queues[winner].len();
                self.events
                    .push_back(QueueEvent::QueueSizeChange { message_id, size });
            }

            if frame_data.is_empty() {
                break;
            }
            msg.frames.push(frame_data);
        }

        if !msg.frames.is_empty() {
            if packet_dest != QUERY_DESTINATION_ID {
                msg.dest = packet_dest;
            }
            msg.ack_requested = packet_ack;
        }
    }

    /// The eligible queue maximising priority; ties resolve to earlier
    /// registration, then lexically smaller name.
    fn find_next_sender(
        &self,
        max_frame_bytes: u32,
        dest: ModemId,
        ack_allowed: Option<bool>,
        used: usize,
    ) -> Option<usize> {
        debug!("starting priority contest (dest: {dest}, used: {used})");
        let mut winner: Option<(usize, f64)> = None;
        for (idx, q) in self.queues.iter().enumerate() {
            if let Some(p) = q.priority_for(max_frame_bytes, dest, ack_allowed, used) {
                // iteration is registration order, so on a priority tie
                // the earlier queue keeps the win
                let better = match winner {
                    None => true,
                    Some((_, wp)) => p > wp,
                };
                if better {
                    winner = Some((idx, p));
                }
            }
        }
        if let Some((idx, p)) = winner {
            debug!("\t{} won with priority {p}", self.queues[idx].name());
        }
        winner.map(|(idx, _)| idx)
    }

    /// Inbound traffic from a driver: ACK bookkeeping for `Ack`
    /// transmissions, decode + dispatch for `Data`.
    pub fn handle_modem_receive(&mut self, msg: &ModemTransmission) {
        match msg.kind {
            TransmissionKind::Ack => {
                if msg.dest != self.cfg.modem_id {
                    debug!("ignoring ack for modem id {}", msg.dest);
                    return;
                }
                for &frame in &msg.acked_frames {
                    self.process_modem_ack(frame, msg);
                }
            }
            TransmissionKind::Data => {
                if msg.dest != self.cfg.modem_id && msg.dest != BROADCAST_ID {
                    debug!("ignoring data addressed to modem id {}", msg.dest);
                    return;
                }
                for frame in &msg.frames {
                    if frame.is_empty() {
                        continue;
                    }
                    match self.codec.decode_all(frame) {
                        Ok(decoded) => {
                            for m in decoded {
                                let id = self.codec.message_id(&m);
                                if self.queue(id).is_none() {
                                    warn!("received message for unregistered queue id {id}");
                                    continue;
                                }
                                self.events.push_back(QueueEvent::Receive(m));
                            }
                        }
                        Err(e) => warn!("failed to decode received frame: {e}"),
                    }
                }
            }
            TransmissionKind::DriverSpecific => {
                debug!("ignoring driver-specific transmission in queue layer");
            }
        }
    }

    fn process_modem_ack(&mut self, frame: u32, ack_msg: &ModemTransmission) {
        let mut acked = Vec::new();
        for q in &mut self.queues {
            let message_id = q.cfg().message_id;
            while let Some(orig) = q.pop_ack(frame) {
                acked.push((message_id, q.len(), orig));
            }
        }
        if acked.is_empty() {
            debug!("got ack for frame {frame} with no queued message waiting");
        }
        for (message_id, size, orig) in acked {
            self.events.push_back(QueueEvent::Ack {
                ack: ack_msg.clone(),
                orig,
            });
            self.events
                .push_back(QueueEvent::QueueSizeChange { message_id, size });
        }
    }

    /// Time-driven work: TTL expiry across every queue, FIFO per queue.
    pub fn do_work(&mut self) {
        let mut expired = Vec::new();
        for q in &mut self.queues {
            let message_id = q.cfg().message_id;
            for m in q.expire() {
                expired.push((message_id, q.len(), m));
            }
        }
        for (message_id, size, m) in expired {
            self.events.push_back(QueueEvent::Expire(m));
            self.events
                .push_back(QueueEvent::QueueSizeChange { message_id, size });
        }
    }

    /// Delete all messages in the queue for `message_id`.
    pub fn flush_queue(&mut self, message_id: u32) {
        if let Some(q) = self.queue_mut(message_id) {
            q.flush();
            self.events.push_back(QueueEvent::QueueSizeChange {
                message_id,
                size: 0,
            });
        }
    }
}

impl<C: Codec> crate::driver::PayloadSource for QueueManager<C> {
    fn modify_transmission(&mut self, _msg: &mut ModemTransmission) {}

    fn data_request(&mut self, msg: &mut ModemTransmission) {
        self.handle_modem_data_request(msg);
    }
}
