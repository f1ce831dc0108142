//! The bounded AT-sentence ring shared by the command-mode state
//! machines (Iridium and Benthos).
//!
//! Each pending sentence carries its retry metadata; the head of the ring
//! is (re)sent whenever its per-command timeout lapses, and too many
//! retries reset the whole state machine. Overflow drops the oldest
//! sentence, circular-buffer style.

use heapless::Deque;

use crate::clock::TimePoint;

/// Sentences kept in flight before the oldest is dropped.
pub const AT_BUFFER_CAPACITY: usize = 100;

/// One queued command with its retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct PendingAt {
    /// The sentence without the `AT` prefix or terminator (`+SBDIX`,
    /// `D8816...`, `""` for a bare `AT`).
    pub body: String,
    pub last_send_time: Option<TimePoint>,
    pub tries: u8,
}

impl PendingAt {
    pub fn new(body: impl Into<String>) -> Self {
        PendingAt {
            body: body.into(),
            last_send_time: None,
            tries: 0,
        }
    }
}

/// FIFO of pending AT sentences with bounded capacity.
#[derive(Debug, Default)]
pub struct AtRing {
    out: Deque<PendingAt, AT_BUFFER_CAPACITY>,
}

impl AtRing {
    pub fn new() -> Self {
        AtRing::default()
    }

    /// Queue a sentence at the back; drops the oldest when full.
    pub fn push(&mut self, body: impl Into<String>) {
        if self.out.is_full() {
            let _ = self.out.pop_front();
        }
        // capacity just ensured
        let _ = self.out.push_back(PendingAt::new(body));
    }

    /// Queue a sentence to send before everything else (echo-off
    /// recovery, the RUDICS `goby` banner).
    pub fn push_front(&mut self, body: impl Into<String>) {
        if self.out.is_full() {
            let _ = self.out.pop_back();
        }
        let _ = self.out.push_front(PendingAt::new(body));
    }

    pub fn front(&self) -> Option<&PendingAt> {
        self.out.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut PendingAt> {
        self.out.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<PendingAt> {
        self.out.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn clear(&mut self) {
        self.out.clear();
    }

    /// Head sentence body, if any.
    pub fn head_body(&self) -> Option<&str> {
        self.out.front().map(|p| p.body.as_str())
    }
}
