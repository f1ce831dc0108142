//! A single per-message-type send queue.
//!
//! Entries live here from `push` until one of three disjoint ends: popped
//! into a frame (no ACK wanted), removed by an ACK, or evicted at TTL
//! expiry. Entries waiting for an ACK stay in the list but are skipped by
//! the selector, indexed by the driver frame number they went out in.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;

use crate::clock::{Clock, TimePoint};
use crate::consts::{BROADCAST_ID, ModemId};

/// Where a metadata value comes from at push time.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Role {
    /// Not configured; the manager default applies.
    #[default]
    Unset,
    /// A fixed value from configuration.
    Static(i64),
    /// Read from a named field of the message via the codec.
    Field(String),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Human-readable queue name, used in logs and for priority ties.
    pub name: String,
    /// Codec identity of the message type this queue carries.
    pub message_id: u32,
    /// Request an ACK for entries of this queue.
    pub ack: bool,
    /// Minimum interval between successive sends from this queue.
    pub blackout: Duration,
    /// Entries kept before the queue overflows; 0 means unbounded.
    pub max_queue: usize,
    /// Overflow and selection end: false = FIFO, true = LIFO.
    pub newest_first: bool,
    /// Entries older than this are evicted unsent.
    pub ttl: Duration,
    /// Scales priority growth against other queues.
    pub value_base: f64,
    pub dest_role: Role,
    pub src_role: Role,
    pub time_role: Role,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: String::new(),
            message_id: 0,
            ack: false,
            blackout: Duration::ZERO,
            max_queue: 0,
            newest_first: false,
            ttl: Duration::from_secs(1800),
            value_base: 1.0,
            dest_role: Role::Unset,
            src_role: Role::Unset,
            time_role: Role::Unset,
        }
    }
}

/// Metadata resolved at push time (role mapping applied).
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub src: ModemId,
    pub dest: ModemId,
    pub time: TimePoint,
    pub ack_requested: bool,
    /// Encoded size; fixed at push so selection never re-encodes.
    pub non_repeated_size: usize,
    pub last_sent_time: Option<TimePoint>,
}

#[derive(Debug, Clone)]
pub struct QueueEntry<M> {
    pub msg: M,
    pub encoded: Vec<u8>,
    pub meta: EntryMeta,
    /// Identity that survives deque reshuffling; ACK-wait bindings refer
    /// to entries by serial.
    serial: u64,
}

/// Outcome of [`Queue::give_data`].
#[derive(Debug)]
pub struct GivenData<M> {
    pub encoded: Vec<u8>,
    pub ack_requested: bool,
    pub dest: ModemId,
    /// The message, when the entry left the queue immediately (no ACK).
    pub popped: Option<M>,
}

#[derive(Debug)]
pub struct Queue<M> {
    cfg: QueueConfig,
    clock: Clock,
    entries: VecDeque<QueueEntry<M>>,
    /// frame number -> entry serial; a frame may carry several entries.
    waiting_for_ack: Vec<(u32, u64)>,
    last_send_time: TimePoint,
    next_serial: u64,
}

impl<M: Clone> Queue<M> {
    pub fn new(cfg: QueueConfig, clock: Clock) -> Self {
        let now = clock.now();
        Queue {
            cfg,
            clock,
            entries: VecDeque::new(),
            waiting_for_ack: Vec::new(),
            last_send_time: now,
            next_serial: 0,
        }
    }

    pub fn cfg(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; on overflow evict per `newest_first` and return
    /// the evicted message.
    pub fn push_entry(&mut self, msg: M, encoded: Vec<u8>, meta: EntryMeta) -> Option<M> {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.entries.push_back(QueueEntry {
            msg,
            encoded,
            meta,
            serial,
        });
        debug!(
            "{}: pushed to send stack (queue size {}/{})",
            self.cfg.name,
            self.entries.len(),
            self.cfg.max_queue
        );

        if self.cfg.max_queue > 0 && self.entries.len() > self.cfg.max_queue {
            // newest_first drops the oldest entry, FIFO drops the one
            // that just arrived
            let idx = if self.cfg.newest_first {
                0
            } else {
                self.entries.len() - 1
            };
            let evicted = self.entries.remove(idx);
            if let Some(evicted) = &evicted {
                self.waiting_for_ack.retain(|(_, s)| *s != evicted.serial);
                debug!("{}: queue exceeded, removing entry", self.cfg.name);
            }
            return evicted.map(|e| e.msg);
        }
        None
    }

    fn waiting(&self, serial: u64) -> bool {
        self.waiting_for_ack.iter().any(|(_, s)| *s == serial)
    }

    /// Index of the next entry to send: the end dictated by
    /// `newest_first`, skipping entries already out for ACK.
    fn next_index(&self) -> Option<usize> {
        if self.entries.len() <= self.waiting_for_ack.len() {
            return None;
        }
        if self.cfg.newest_first {
            (0..self.entries.len())
                .rev()
                .find(|&i| !self.waiting(self.entries[i].serial))
        } else {
            (0..self.entries.len()).find(|&i| !self.waiting(self.entries[i].serial))
        }
    }

    /// Peek the entry the next `give_data` would take.
    pub fn next_entry(&self) -> Option<&QueueEntry<M>> {
        self.next_index().map(|i| &self.entries[i])
    }

    /// Hand the next entry's bytes to the driver frame `frame`.
    ///
    /// Broadcast destinations cannot ACK, so the flag is forced off for
    /// them. ACK-requesting entries stay queued, bound to `frame`;
    /// everything else pops now.
    pub fn give_data(&mut self, frame: u32) -> Option<GivenData<M>> {
        let idx = self.next_index()?;
        let now = self.clock.now();

        let mut ack = self.entries[idx].meta.ack_requested;
        if self.entries[idx].meta.dest == BROADCAST_ID && ack {
            debug!(
                "{}: setting ack=false because broadcast cannot ACK",
                self.cfg.name
            );
            ack = false;
        }

        self.last_send_time = now;
        let entry = &mut self.entries[idx];
        entry.meta.ack_requested = ack;
        entry.meta.last_sent_time = Some(now);
        let dest = entry.meta.dest;
        let encoded = entry.encoded.clone();

        let popped = if ack {
            self.waiting_for_ack.push((frame, entry.serial));
            None
        } else {
            debug!("{}: popping from send stack", self.cfg.name);
            self.entries.remove(idx).map(|e| e.msg)
        };

        Some(GivenData {
            encoded,
            ack_requested: ack,
            dest,
            popped,
        })
    }

    /// Remove and return one entry bound to `frame`, if any.
    pub fn pop_ack(&mut self, frame: u32) -> Option<M> {
        let pos = self.waiting_for_ack.iter().position(|(f, _)| *f == frame)?;
        let (_, serial) = self.waiting_for_ack.remove(pos);
        let idx = self.entries.iter().position(|e| e.serial == serial)?;
        debug!("{}: ACK received, popping from send stack", self.cfg.name);
        self.entries.remove(idx).map(|e| e.msg)
    }

    /// Evict every entry whose TTL has elapsed, oldest first.
    pub fn expire(&mut self) -> Vec<M> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.meta.time + self.cfg.ttl < now {
                debug!(
                    "{}: expiring from send stack (qsize {})",
                    self.cfg.name,
                    self.entries.len() - 1
                );
                let serial = front.serial;
                self.waiting_for_ack.retain(|(_, s)| *s != serial);
                if let Some(e) = self.entries.pop_front() {
                    expired.push(e.msg);
                }
            } else {
                break;
            }
        }
        expired
    }

    /// Drop ACK-wait bindings the driver has advanced past
    /// (`frame >= start_frame`, the counter came around) and bindings
    /// older than `minimum_ack_wait` (give the data another chance).
    pub fn clear_ack_queue(&mut self, start_frame: u32, minimum_ack_wait: Duration) {
        let now = self.clock.now();
        let name = &self.cfg.name;
        let entries = &self.entries;
        self.waiting_for_ack.retain(|(frame, serial)| {
            if *frame >= start_frame {
                debug!("{name}: clearing ack binding, frame counter advanced past {frame}");
                return false;
            }
            let last_sent = entries
                .iter()
                .find(|e| e.serial == *serial)
                .and_then(|e| e.meta.last_sent_time);
            match last_sent {
                Some(t) if t + minimum_ack_wait < now => {
                    debug!("{name}: clearing ack binding, minimum ack wait elapsed");
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }

    /// Selector predicate + priority. `Some(priority)` when this queue is
    /// a candidate for a request with `max_frame_bytes`/`dest`/`ack`
    /// parameters and `used` bytes already committed to the frame.
    pub fn priority_for(
        &self,
        max_frame_bytes: u32,
        dest: ModemId,
        ack_allowed: Option<bool>,
        used: usize,
    ) -> Option<f64> {
        use crate::consts::QUERY_DESTINATION_ID;

        let now = self.clock.now();
        let priority = now.micros_since(self.last_send_time) as f64
            / self.cfg.ttl.as_micros() as f64
            * self.cfg.value_base;

        let next = self.next_entry()?;

        if self.last_send_time + self.cfg.blackout > now {
            debug!("\t{} is in blackout", self.cfg.name);
            return None;
        }
        if next.meta.non_repeated_size > (max_frame_bytes as usize).saturating_sub(used) {
            debug!(
                "\t{} next message is too large {{{}}}",
                self.cfg.name, next.meta.non_repeated_size
            );
            return None;
        }
        if !(dest == QUERY_DESTINATION_ID || next.meta.dest == BROADCAST_ID || dest == next.meta.dest)
        {
            debug!(
                "\t{} next message has wrong destination {}",
                self.cfg.name, next.meta.dest
            );
            return None;
        }
        if ack_allowed == Some(false) && next.meta.ack_requested && dest != BROADCAST_ID {
            debug!(
                "\t{} next message requires ACK and the packet does not",
                self.cfg.name
            );
            return None;
        }

        debug!(
            "\t{} ({}B) has priority value: {priority}",
            self.cfg.name, next.meta.non_repeated_size
        );
        Some(priority)
    }

    /// Delete every entry and ACK binding.
    pub fn flush(&mut self) {
        debug!("flushing stack {} (qsize 0)", self.cfg.name);
        self.entries.clear();
        self.waiting_for_ack.clear();
    }
}
