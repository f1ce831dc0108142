//! Destination-keyed priority subbuffers.
//!
//! Where the queue layer keys traffic by message *type*, the dynamic
//! buffer keys byte strings by `(destination, subbuffer id)`. Each
//! subbuffer carries its own TTL, value and queueing policy; `top` runs
//! the same value/TTL priority contest as the queue selector and is
//! intended to be called from a driver data request.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::clock::{Clock, TimePoint};
use crate::consts::{ModemId, QUERY_DESTINATION_ID};

#[derive(Debug, Error)]
pub enum DynamicBufferError {
    #[error("no subbuffer {id} for destination {dest}")]
    NoSuchSubbuffer { dest: ModemId, id: String },
    #[error("subbuffer {0} already exists for this destination")]
    DuplicateSubbuffer(String),
}

/// Per-subbuffer policy.
#[derive(Debug, Clone)]
pub struct SubbufferConfig {
    pub ttl: Duration,
    pub value_base: f64,
    pub max_queue: usize,
    pub newest_first: bool,
    pub ack_required: bool,
    pub blackout: Duration,
}

impl Default for SubbufferConfig {
    fn default() -> Self {
        SubbufferConfig {
            ttl: Duration::from_secs(1800),
            value_base: 1.0,
            max_queue: 1000,
            newest_first: true,
            ack_required: false,
            blackout: Duration::ZERO,
        }
    }
}

/// One buffered byte string with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferValue {
    pub dest: ModemId,
    pub subbuffer_id: String,
    pub push_time: TimePoint,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Subbuffer {
    id: String,
    dest: ModemId,
    cfg: SubbufferConfig,
    values: VecDeque<(TimePoint, Vec<u8>)>,
    last_access: TimePoint,
}

impl Subbuffer {
    fn top_index(&self) -> Option<usize> {
        if self.values.is_empty() {
            return None;
        }
        Some(if self.cfg.newest_first {
            self.values.len() - 1
        } else {
            0
        })
    }
}

/// All subbuffers for all destinations.
#[derive(Debug)]
pub struct DynamicBuffer {
    clock: Clock,
    subbuffers: Vec<Subbuffer>,
}

impl DynamicBuffer {
    pub fn new(clock: Clock) -> Self {
        DynamicBuffer {
            clock,
            subbuffers: Vec::new(),
        }
    }

    /// Create the subbuffer `(dest, id)` with `cfg`.
    pub fn create(
        &mut self,
        dest: ModemId,
        id: impl Into<String>,
        cfg: SubbufferConfig,
    ) -> Result<(), DynamicBufferError> {
        let id = id.into();
        if self.find(dest, &id).is_some() {
            return Err(DynamicBufferError::DuplicateSubbuffer(id));
        }
        debug!("creating subbuffer {id} for destination {dest}");
        self.subbuffers.push(Subbuffer {
            id,
            dest,
            cfg,
            values: VecDeque::new(),
            last_access: self.clock.now(),
        });
        Ok(())
    }

    fn find(&self, dest: ModemId, id: &str) -> Option<usize> {
        self.subbuffers
            .iter()
            .position(|s| s.dest == dest && s.id == id)
    }

    /// Buffer `data`; returns values evicted by `max_queue` overflow.
    pub fn push(
        &mut self,
        dest: ModemId,
        id: &str,
        data: Vec<u8>,
    ) -> Result<Vec<BufferValue>, DynamicBufferError> {
        let now = self.clock.now();
        let idx = self
            .find(dest, id)
            .ok_or_else(|| DynamicBufferError::NoSuchSubbuffer {
                dest,
                id: id.to_string(),
            })?;
        let sub = &mut self.subbuffers[idx];
        sub.values.push_back((now, data));

        let mut evicted = Vec::new();
        while sub.cfg.max_queue > 0 && sub.values.len() > sub.cfg.max_queue {
            // evict from the end that top() would take last
            let victim = if sub.cfg.newest_first {
                sub.values.pop_front()
            } else {
                sub.values.pop_back()
            };
            if let Some((push_time, data)) = victim {
                evicted.push(BufferValue {
                    dest,
                    subbuffer_id: sub.id.clone(),
                    push_time,
                    data,
                });
            }
        }
        Ok(evicted)
    }

    /// Total buffered values for `dest`.
    pub fn size(&self, dest: ModemId) -> usize {
        self.subbuffers
            .iter()
            .filter(|s| s.dest == dest)
            .map(|s| s.values.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subbuffers.iter().all(|s| s.values.is_empty())
    }

    /// The highest-priority value at most `max_bytes` long for `dest`
    /// (or for any destination when `dest` is the query id). The value
    /// stays buffered until [`DynamicBuffer::erase`] (for
    /// ACK-required subbuffers) so a lost transmission can be retried.
    /// Values from subbuffers without `ack_required` are removed
    /// immediately.
    pub fn top(&mut self, dest: ModemId, max_bytes: usize) -> Option<BufferValue> {
        let now = self.clock.now();

        let mut winner: Option<(usize, f64)> = None;
        for (idx, sub) in self.subbuffers.iter().enumerate() {
            if dest != QUERY_DESTINATION_ID && sub.dest != dest {
                continue;
            }
            let Some(top) = sub.top_index() else { continue };
            if sub.values[top].1.len() > max_bytes {
                continue;
            }
            if sub.last_access + sub.cfg.blackout > now {
                debug!("\t{} is in blackout", sub.id);
                continue;
            }
            let p = now.micros_since(sub.last_access) as f64 / sub.cfg.ttl.as_micros() as f64
                * sub.cfg.value_base;
            let better = match winner {
                None => true,
                Some((widx, wp)) => {
                    p > wp || (p == wp && sub.id < self.subbuffers[widx].id)
                }
            };
            if better {
                winner = Some((idx, p));
            }
        }

        let (idx, _) = winner?;
        let sub = &mut self.subbuffers[idx];
        sub.last_access = now;
        let top = sub.top_index()?;
        let value = BufferValue {
            dest: sub.dest,
            subbuffer_id: sub.id.clone(),
            push_time: sub.values[top].0,
            data: sub.values[top].1.clone(),
        };
        if !sub.cfg.ack_required {
            sub.values.remove(top);
        }
        Some(value)
    }

    /// Remove a previously returned value (after its ACK arrived).
    pub fn erase(&mut self, value: &BufferValue) -> Result<bool, DynamicBufferError> {
        let idx = self.find(value.dest, &value.subbuffer_id).ok_or_else(|| {
            DynamicBufferError::NoSuchSubbuffer {
                dest: value.dest,
                id: value.subbuffer_id.clone(),
            }
        })?;
        let sub = &mut self.subbuffers[idx];
        if let Some(pos) = sub
            .values
            .iter()
            .position(|(t, d)| *t == value.push_time && *d == value.data)
        {
            sub.values.remove(pos);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Evict every value past its subbuffer's TTL, oldest first.
    pub fn expire(&mut self) -> Vec<BufferValue> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for sub in &mut self.subbuffers {
            while let Some((push_time, _)) = sub.values.front() {
                if *push_time + sub.cfg.ttl < now {
                    if let Some((push_time, data)) = sub.values.pop_front() {
                        expired.push(BufferValue {
                            dest: sub.dest,
                            subbuffer_id: sub.id.clone(),
                            push_time,
                            data,
                        });
                    }
                } else {
                    break;
                }
            }
        }
        expired
    }
}
